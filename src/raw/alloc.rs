use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use seize::Collector;

use super::Entry;

// A shard table allocation.
pub struct RawTable<V> {
    slots: Box<[AtomicPtr<Entry<V>>]>,
}

// Manages a table allocation.
pub struct Table<V> {
    // Mask for the table length.
    pub mask: usize,
    // The raw table pointer.
    pub raw: *mut RawTable<V>,
}

impl<V> Copy for Table<V> {}

impl<V> Clone for Table<V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<V> Table<V> {
    // Allocate an empty table with the provided length.
    pub fn alloc(len: usize) -> Table<V> {
        assert!(len.is_power_of_two());

        let slots = (0..len).map(|_| AtomicPtr::new(ptr::null_mut())).collect();
        let raw = Box::into_raw(Box::new(RawTable { slots }));

        Table { mask: len - 1, raw }
    }

    // Creates a `Table` from a raw pointer.
    //
    // # Safety
    //
    // The pointer must refer to a live table allocation.
    #[inline]
    pub unsafe fn from_raw(raw: *mut RawTable<V>) -> Table<V> {
        // Safety: Guaranteed by caller.
        let len = unsafe { (&(*raw).slots).len() };

        Table { mask: len - 1, raw }
    }

    // Returns the number of slots in the table.
    #[inline]
    pub fn len(&self) -> usize {
        self.mask + 1
    }

    // Returns the slot at the given index.
    //
    // # Safety
    //
    // The table must still be live, and `i` must be in-bounds.
    #[inline]
    pub unsafe fn slot(&self, i: usize) -> &AtomicPtr<Entry<V>> {
        debug_assert!(i <= self.mask);

        // Safety: Guaranteed by caller.
        unsafe { (&(*self.raw).slots).get_unchecked(i) }
    }

    // Drop every entry still stored in the table.
    //
    // # Safety
    //
    // The table must be unreachable, and its entries must not be stored anywhere else.
    pub unsafe fn drop_entries(&self) {
        // Safety: Guaranteed by caller.
        for slot in unsafe { (&(*self.raw).slots).iter() } {
            let entry = slot.load(Ordering::Relaxed);
            if !entry.is_null() {
                // Safety: Entries are allocated with `Box` and owned by exactly one table.
                drop(unsafe { Box::from_raw(entry) });
            }
        }
    }

    // Deallocate the table, leaving its entries untouched.
    //
    // # Safety
    //
    // The table must not be accessed after this call.
    pub unsafe fn dealloc(table: Table<V>) {
        // Safety: Guaranteed by caller.
        drop(unsafe { Box::from_raw(table.raw) });
    }
}

// Reclaims a table whose entries were moved into a larger table.
pub unsafe fn reclaim_table<V>(raw: *mut RawTable<V>, _collector: &Collector) {
    // Safety: The table was retired after being unlinked from its shard.
    unsafe { Table::dealloc(Table::from_raw(raw)) }
}

// Reclaims a cleared table along with every entry it still holds.
pub unsafe fn reclaim_cleared<V>(raw: *mut RawTable<V>, _collector: &Collector) {
    // Safety: The table was retired after being unlinked from its shard, and
    // cleared entries are not linked into the replacement table.
    unsafe {
        let table = Table::from_raw(raw);
        table.drop_entries();
        Table::dealloc(table);
    }
}
