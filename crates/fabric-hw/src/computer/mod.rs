//! Computers: groups of processors and the unit of core reservation
//!
//! The reservation table owned by a computer is the source of truth for who
//! holds a core. Allocation scans processor-major, core-minor and hands out an
//! [`AllocatedCore`] token which must be given back unchanged on release.

mod actor;

pub use actor::ComputerHandle;

use std::collections::HashSet;
use std::hash::{Hash, Hasher};

use crate::processor::{ProcessorHandle, ProcessorSpec};
use crate::types::{ComputerId, Frequency, ProcessorId};
use crate::{HwError, Result};

/// Construction parameters of a computer
#[derive(Debug, Clone, PartialEq)]
pub struct ComputerSpec {
    /// Computer id, unique across the fabric
    pub id: ComputerId,
    /// Processors in index order
    pub processors: Vec<ProcessorSpec>,
}

impl ComputerSpec {
    /// Create a spec
    pub fn new(id: ComputerId, processors: Vec<ProcessorSpec>) -> Self {
        Self { id, processors }
    }

    /// A computer of `count` processors cloned from `template`
    ///
    /// Processor ids are assigned consecutively from `first_processor`; the
    /// range must fit in the id space.
    pub fn homogeneous(
        id: ComputerId,
        first_processor: ProcessorId,
        count: usize,
        template: &ProcessorSpec,
    ) -> Result<Self> {
        let out_of_ids = || {
            HwError::InvalidConfig(format!(
                "{count} processors from {first_processor} overflow the processor id space"
            ))
        };
        let count = u32::try_from(count).map_err(|_| out_of_ids())?;
        if count > 0 {
            first_processor.0.checked_add(count - 1).ok_or_else(out_of_ids)?;
        }
        let processors = (0..count)
            .map(|i| template.clone().with_id(ProcessorId(first_processor.0 + i)))
            .collect();
        Ok(Self { id, processors })
    }

    /// Check every processor and the uniqueness of their ids
    pub fn validate(&self) -> Result<()> {
        if self.processors.is_empty() {
            return Err(HwError::InvalidConfig(format!(
                "{} must have at least one processor",
                self.id
            )));
        }
        let mut seen = HashSet::new();
        for processor in &self.processors {
            processor.validate()?;
            if !seen.insert(processor.id) {
                return Err(HwError::InvalidConfig(format!(
                    "{} declares {} twice",
                    self.id, processor.id
                )));
            }
        }
        Ok(())
    }

    /// Total number of cores
    #[must_use]
    pub fn total_cores(&self) -> usize {
        self.processors.iter().map(|p| p.cores).sum()
    }
}

/// Token for one reserved core
///
/// Identity is the `(computer, processor_index, core_no)` triple; the other
/// fields are what the holder needs to drive the core.
#[derive(Debug, Clone)]
pub struct AllocatedCore {
    /// Computer that reserved the core
    pub computer_id: ComputerId,
    /// Processor position inside the computer
    pub processor_index: usize,
    /// Processor id
    pub processor_id: ProcessorId,
    /// Core number inside the processor
    pub core_no: usize,
    /// Core frequency when the reservation was made
    pub frequency: Frequency,
    /// Handle to the owning processor
    pub processor: ProcessorHandle,
}

impl AllocatedCore {
    fn key(&self) -> (ComputerId, usize, usize) {
        (self.computer_id, self.processor_index, self.core_no)
    }
}

impl PartialEq for AllocatedCore {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for AllocatedCore {}

impl Hash for AllocatedCore {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl std::fmt::Display for AllocatedCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/core-{}",
            self.computer_id, self.processor_id, self.core_no
        )
    }
}

/// Reservation bits and last known frequency of every core of a computer
#[derive(Debug, Clone, PartialEq)]
pub struct ReservationTable {
    reserved: Vec<Vec<bool>>,
    frequencies: Vec<Vec<Frequency>>,
}

impl ReservationTable {
    /// Table with every core free, one row per processor
    pub fn new(rows: impl IntoIterator<Item = (usize, Frequency)>) -> Self {
        let (reserved, frequencies): (Vec<_>, Vec<_>) = rows
            .into_iter()
            .map(|(cores, frequency)| (vec![false; cores], vec![frequency; cores]))
            .unzip();
        Self {
            reserved,
            frequencies,
        }
    }

    /// Table matching a computer spec
    pub fn for_spec(spec: &ComputerSpec) -> Self {
        Self::new(
            spec.processors
                .iter()
                .map(|p| (p.cores, p.default_frequency)),
        )
    }

    /// Reserve the first free core, processor-major
    pub fn allocate(&mut self) -> Option<(usize, usize)> {
        for (p, row) in self.reserved.iter_mut().enumerate() {
            if let Some(c) = row.iter().position(|reserved| !reserved) {
                row[c] = true;
                return Some((p, c));
            }
        }
        None
    }

    /// Clear a reservation; false when the core was not reserved
    pub fn release(&mut self, processor_index: usize, core_no: usize) -> bool {
        match self
            .reserved
            .get_mut(processor_index)
            .and_then(|row| row.get_mut(core_no))
        {
            Some(bit) if *bit => {
                *bit = false;
                true
            }
            _ => false,
        }
    }

    /// True if the core is reserved
    #[must_use]
    pub fn is_reserved(&self, processor_index: usize, core_no: usize) -> bool {
        self.reserved
            .get(processor_index)
            .and_then(|row| row.get(core_no))
            .copied()
            .unwrap_or(false)
    }

    /// Last known frequency of a core
    #[must_use]
    pub fn frequency(&self, processor_index: usize, core_no: usize) -> Option<Frequency> {
        self.frequencies
            .get(processor_index)
            .and_then(|row| row.get(core_no))
            .copied()
    }

    /// Record a frequency change
    pub fn set_frequency(&mut self, processor_index: usize, core_no: usize, frequency: Frequency) {
        if let Some(slot) = self
            .frequencies
            .get_mut(processor_index)
            .and_then(|row| row.get_mut(core_no))
        {
            *slot = frequency;
        }
    }

    /// Number of cores in a processor row
    #[must_use]
    pub fn cores_in(&self, processor_index: usize) -> Option<usize> {
        self.reserved.get(processor_index).map(Vec::len)
    }

    /// Number of reserved cores
    #[must_use]
    pub fn reserved_count(&self) -> usize {
        self.reserved.iter().flatten().filter(|r| **r).count()
    }

    /// Number of free cores
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.total() - self.reserved_count()
    }

    /// Total number of cores
    #[must_use]
    pub fn total(&self) -> usize {
        self.reserved.iter().map(Vec::len).sum()
    }

    /// Reservation bits per processor
    #[must_use]
    pub fn reserved(&self) -> &[Vec<bool>] {
        &self.reserved
    }

    /// Frequencies per processor
    #[must_use]
    pub fn frequencies(&self) -> &[Vec<Frequency>] {
        &self.frequencies
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::FrequencyLevel;
    use proptest::prelude::*;

    fn table() -> ReservationTable {
        ReservationTable::new([(2, Frequency::new(1500)), (3, Frequency::new(1500))])
    }

    #[test]
    fn test_allocate_is_processor_major() {
        let mut t = table();
        assert_eq!(t.allocate(), Some((0, 0)));
        assert_eq!(t.allocate(), Some((0, 1)));
        assert_eq!(t.allocate(), Some((1, 0)));
        assert_eq!(t.reserved_count(), 3);
        assert_eq!(t.free_count(), 2);
    }

    #[test]
    fn test_allocate_reuses_released_core() {
        let mut t = table();
        for _ in 0..5 {
            t.allocate().unwrap();
        }
        assert_eq!(t.allocate(), None);

        assert!(t.release(0, 1));
        assert_eq!(t.allocate(), Some((0, 1)));
    }

    #[test]
    fn test_release_unreserved_core_fails() {
        let mut t = table();
        assert!(!t.release(0, 0));
        assert!(!t.release(9, 0));
        assert!(!t.release(0, 9));
    }

    #[test]
    fn test_frequency_tracking() {
        let mut t = table();
        t.set_frequency(1, 2, Frequency::new(3000));
        assert_eq!(t.frequency(1, 2), Some(Frequency::new(3000)));
        assert_eq!(t.frequency(0, 0), Some(Frequency::new(1500)));
        assert_eq!(t.frequency(4, 0), None);
    }

    #[test]
    fn test_homogeneous_spec_ids() {
        let template = ProcessorSpec::new(
            ProcessorId(0),
            2,
            [FrequencyLevel::new(Frequency::new(1500), 1.5e6)],
            Frequency::new(1500),
            0,
        );
        let spec = ComputerSpec::homogeneous(ComputerId(1), ProcessorId(10), 3, &template).unwrap();
        let ids: Vec<_> = spec.processors.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![ProcessorId(10), ProcessorId(11), ProcessorId(12)]);
        assert_eq!(spec.total_cores(), 6);
        assert!(spec.validate().is_ok());

        // Last id would be u32::MAX + 1
        let err = ComputerSpec::homogeneous(ComputerId(2), ProcessorId(u32::MAX), 2, &template)
            .unwrap_err();
        assert!(matches!(err, HwError::InvalidConfig(_)));
        assert!(ComputerSpec::homogeneous(ComputerId(2), ProcessorId(u32::MAX), 1, &template).is_ok());
    }

    #[test]
    fn test_duplicate_processor_ids_rejected() {
        let p = ProcessorSpec::new(
            ProcessorId(0),
            1,
            [FrequencyLevel::new(Frequency::new(1500), 1.5e6)],
            Frequency::new(1500),
            0,
        );
        let spec = ComputerSpec::new(ComputerId(0), vec![p.clone(), p]);
        assert!(matches!(spec.validate(), Err(HwError::InvalidConfig(_))));

        let empty = ComputerSpec::new(ComputerId(0), Vec::new());
        assert!(empty.validate().is_err());
    }

    proptest! {
        #[test]
        fn reserved_never_exceeds_total(ops in proptest::collection::vec(any::<Option<(u8, u8)>>(), 0..64)) {
            let mut t = table();
            for op in ops {
                match op {
                    None => { t.allocate(); }
                    Some((p, c)) => { t.release(p as usize % 3, c as usize % 4); }
                }
                prop_assert!(t.reserved_count() <= t.total());
                prop_assert_eq!(t.reserved_count() + t.free_count(), t.total());
            }
        }

        #[test]
        fn allocate_release_round_trip(pre in 0usize..5) {
            let mut t = table();
            for _ in 0..pre {
                t.allocate();
            }
            let before = t.free_count();
            if let Some((p, c)) = t.allocate() {
                prop_assert!(t.release(p, c));
            }
            prop_assert_eq!(t.free_count(), before);
        }
    }
}
