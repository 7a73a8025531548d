//! Helpers for unit tests that need a reserved, shadowed address range.

use std::sync::Arc;

use crate::shadow::ShadowMemoryMap;
use crate::vm::Mapping;

pub(crate) struct TestSpace {
    shadow: Arc<ShadowMemoryMap>,
    mapping: Mapping,
}

impl TestSpace {
    pub(crate) fn new(size: usize, align: usize) -> Self {
        let mapping = Mapping::reserve(size, align).expect("reserve test space");
        let shadow = ShadowMemoryMap::new(mapping.beg(), mapping.size()).expect("map shadow");
        Self {
            shadow: Arc::new(shadow),
            mapping,
        }
    }

    pub(crate) fn beg(&self) -> usize {
        self.mapping.beg()
    }

    pub(crate) fn shadow(&self) -> Arc<ShadowMemoryMap> {
        Arc::clone(&self.shadow)
    }
}
