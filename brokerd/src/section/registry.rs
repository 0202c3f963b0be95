//! Section Registry (SPEC_FULL.md §4.6): process-wide table of
//! sections with exclusive single-thread ownership, guarded by one
//! mutex, per spec.md §5's concurrency model.

use std::sync::Mutex;

use crate::model::Section;

pub struct SectionRegistry {
    sections: Mutex<Vec<Section>>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ReleaseError {
    IndexOutOfRange,
    NameMismatch,
    NotOwner,
}

impl SectionRegistry {
    pub fn new(sections: Vec<Section>) -> Self {
        Self { sections: Mutex::new(sections) }
    }

    pub fn len(&self) -> usize {
        self.sections.lock().expect("section registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// O(n_sections) scan for the first free section, per spec.md
    /// §4.6. Returns `(index, section_name)` on success.
    pub fn acquire(&self, tid: u64) -> Option<(usize, String)> {
        self.acquire_named(tid, None)
    }

    /// Same scan, but tries a name match first: a client that names a
    /// section it wants gets that one if free, otherwise falls back to
    /// the first free section like a plain `acquire`.
    pub fn acquire_named(&self, tid: u64, preferred: Option<&str>) -> Option<(usize, String)> {
        let mut sections = self.sections.lock().expect("section registry lock poisoned");
        let preferred = preferred.filter(|n| !n.is_empty());
        let by_name = preferred.and_then(|name| {
            sections.iter().position(|s| s.assigned_tid.is_none() && s.name == name)
        });
        let idx = by_name.or_else(|| sections.iter().position(|s| s.assigned_tid.is_none()))?;
        let s = &mut sections[idx];
        s.assigned_tid = Some(tid);
        Some((idx, s.name.clone()))
    }

    /// Counts devices with a given `pkg_id` across every section,
    /// regardless of which client currently holds it. Backs
    /// `PF_DEV_INFO`'s VF count.
    pub fn count_devices_with_pkg_id(&self, pkg_id: u16) -> u16 {
        let sections = self.sections.lock().expect("section registry lock poisoned");
        sections.iter().flat_map(|s| s.devices.iter()).filter(|d| d.pkg_id == pkg_id).count() as u16
    }

    /// Validates index range, section name, and owning thread before
    /// clearing assignment.
    pub fn release(&self, index: usize, tid: u64, expected_name: &str) -> Result<(), ReleaseError> {
        let mut sections = self.sections.lock().expect("section registry lock poisoned");
        let section = sections.get_mut(index).ok_or(ReleaseError::IndexOutOfRange)?;
        if section.name != expected_name {
            return Err(ReleaseError::NameMismatch);
        }
        if section.assigned_tid != Some(tid) {
            return Err(ReleaseError::NotOwner);
        }
        section.assigned_tid = None;
        Ok(())
    }

    /// Runs `f` with read access to section `index`'s data. Used by
    /// info-query handlers, which only run while the caller holds the
    /// section (enforced by the protocol dispatcher, not here).
    pub fn with_section<R>(&self, index: usize, f: impl FnOnce(&Section) -> R) -> Option<R> {
        let sections = self.sections.lock().expect("section registry lock poisoned");
        sections.get(index).map(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(name: &str) -> Section {
        Section { name: name.to_string(), base_name: "SSL".to_string(), assigned_tid: None, devices: vec![] }
    }

    #[test]
    fn acquire_assigns_first_free_section() {
        let registry = SectionRegistry::new(vec![section("SSL_INT_0"), section("SSL_INT_1")]);
        let (idx, name) = registry.acquire(42).unwrap();
        assert_eq!(idx, 0);
        assert_eq!(name, "SSL_INT_0");
    }

    #[test]
    fn acquire_release_is_a_perfect_inverse() {
        let registry = SectionRegistry::new(vec![section("SSL_INT_0")]);
        let (idx, name) = registry.acquire(1).unwrap();
        assert!(registry.acquire(2).is_none());
        registry.release(idx, 1, &name).unwrap();
        let (idx2, _) = registry.acquire(2).unwrap();
        assert_eq!(idx, idx2);
    }

    #[test]
    fn release_rejects_name_mismatch() {
        let registry = SectionRegistry::new(vec![section("SSL_INT_0")]);
        let (idx, _) = registry.acquire(1).unwrap();
        assert_eq!(registry.release(idx, 1, "wrong").unwrap_err(), ReleaseError::NameMismatch);
    }

    #[test]
    fn release_rejects_wrong_owner() {
        let registry = SectionRegistry::new(vec![section("SSL_INT_0")]);
        let (idx, name) = registry.acquire(1).unwrap();
        assert_eq!(registry.release(idx, 2, &name).unwrap_err(), ReleaseError::NotOwner);
    }

    #[test]
    fn concurrent_acquirers_never_get_the_same_index() {
        use std::sync::Arc;
        use std::thread;

        let registry = Arc::new(SectionRegistry::new(
            (0..4).map(|i| section(&format!("SSL_INT_{i}"))).collect(),
        ));
        let handles: Vec<_> = (0..8u64)
            .map(|tid| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || registry.acquire(tid))
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let successes: Vec<_> = results.into_iter().flatten().collect();
        assert_eq!(successes.len(), 4);
        let mut indices: Vec<usize> = successes.iter().map(|(i, _)| *i).collect();
        indices.sort();
        indices.dedup();
        assert_eq!(indices.len(), 4);
    }
}
