use intrusive_list::List;

/// The free list for one buddy order within a zone.
pub struct FreeArea {
    pub free_list: List,
}

impl FreeArea {
    pub const fn new() -> Self {
        Self {
            free_list: List::new(),
        }
    }

    pub fn count(&self) -> usize {
        self.free_list.count()
    }

    pub fn is_empty(&self) -> bool {
        self.free_list.is_empty()
    }
}
