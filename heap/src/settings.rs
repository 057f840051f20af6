use object::{OBJECT_ALIGNMENT, WORD_SIZE, cid};

use crate::OS_PAGE_SIZE;

const KB: usize = 1024;
const MB: usize = 1024 * KB;

/// Sizing of the young and old generations.
#[derive(Debug, Clone)]
pub struct HeapSettings {
    /// Capacity of each semispace at startup.
    pub initial_semispace_capacity: usize,
    /// Upper bound for semispace growth.
    pub max_semispace_capacity: usize,
    /// Size of a regular old-space page.
    pub page_size: usize,
    /// Objects at least this large skip the young generation and get a
    /// page of their own.
    pub large_allocation: usize,
    /// Initial number of remembered-set entries.
    pub remembered_set_capacity: usize,
    /// Number of class ids. The table never grows.
    pub class_table_capacity: usize,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            initial_semispace_capacity: 8 * MB / WORD_SIZE, // 1 MB on 64-bit
            max_semispace_capacity: 2 * 8 * MB,             // 16 MB
            page_size: 256 * KB,
            large_allocation: 32 * KB,
            remembered_set_capacity: 1024,
            class_table_capacity: 1024,
        }
    }
}

impl HeapSettings {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.initial_semispace_capacity == 0 || self.page_size == 0 {
            return Err("Sizes must be > 0");
        }
        if !self.initial_semispace_capacity.is_multiple_of(OS_PAGE_SIZE)
            || !self.max_semispace_capacity.is_multiple_of(OS_PAGE_SIZE)
        {
            return Err("semispace capacities must match OS page alignment");
        }
        if self.initial_semispace_capacity > self.max_semispace_capacity {
            return Err("initial semispace capacity exceeds the maximum");
        }
        if !self.page_size.is_multiple_of(OS_PAGE_SIZE) {
            return Err("page_size must match OS page alignment");
        }
        if !self.large_allocation.is_multiple_of(OBJECT_ALIGNMENT)
            || self.large_allocation == 0
        {
            return Err("large_allocation must be a positive multiple of the object alignment");
        }
        if self.large_allocation >= self.page_size {
            return Err("large_allocation must be smaller than page_size");
        }
        if self.large_allocation > self.initial_semispace_capacity / 2 {
            return Err("large_allocation must fit twice into a semispace");
        }
        if self.remembered_set_capacity < 2 {
            return Err("remembered_set_capacity must be >= 2");
        }
        if self.class_table_capacity <= cid::FIRST_REGULAR_OBJECT {
            return Err("class_table_capacity leaves no room for regular classes");
        }
        if self.class_table_capacity > u32::MAX as usize {
            return Err("class ids must fit the header's class id field");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let settings = HeapSettings::default();
        assert_eq!(settings.validate(), Ok(()));
        assert_eq!(settings.initial_semispace_capacity, MB);
    }

    #[test]
    fn test_rejects_inverted_semispaces() {
        let settings = HeapSettings {
            initial_semispace_capacity: 2 * MB,
            max_semispace_capacity: MB,
            ..HeapSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_rejects_large_threshold_above_page() {
        let settings = HeapSettings {
            large_allocation: 256 * KB,
            ..HeapSettings::default()
        };
        assert!(settings.validate().is_err());
    }
}
