use core::mem::MaybeUninit;

use crate::control::ControlBytes;
use crate::control::EMPTY;
use crate::control::is_full;

cfg_if::cfg_if! {
    if #[cfg(feature = "sixteen-way")] {
        /// Number of lanes in a group.
        pub const GROUP_WIDTH: usize = 16;
    } else {
        /// Number of lanes in a group.
        pub const GROUP_WIDTH: usize = 8;
    }
}

/// Average number of resident lanes per group before the table grows, 7/8
/// of the group width.
pub const MAX_AVG_GROUP_LOAD: usize = GROUP_WIDTH - GROUP_WIDTH / 8;

/// A fixed block of control bytes and the key slots they describe.
///
/// Lane `i` of `ctrl` and lane `i` of `slots` are the same logical slot. A
/// slot is initialized exactly when its control byte is full; the group owns
/// those keys and drops them with itself.
pub(crate) struct Group<K> {
    pub(crate) ctrl: ControlBytes,
    slots: [MaybeUninit<K>; GROUP_WIDTH],
}

impl<K> Group<K> {
    pub(crate) fn new() -> Self {
        Self {
            ctrl: ControlBytes::EMPTY,
            slots: [const { MaybeUninit::uninit() }; GROUP_WIDTH],
        }
    }

    /// Reference to the key stored in `lane`.
    ///
    /// # Safety
    ///
    /// The lane's control byte must be full.
    #[inline(always)]
    pub(crate) unsafe fn key(&self, lane: usize) -> &K {
        debug_assert!(is_full(self.ctrl.get(lane)));
        // SAFETY: Caller ensures the lane is full, so its slot is initialized.
        unsafe { self.slots[lane].assume_init_ref() }
    }

    /// # Safety
    ///
    /// The lane's control byte must be full.
    #[inline(always)]
    pub(crate) unsafe fn key_mut(&mut self, lane: usize) -> &mut K {
        debug_assert!(is_full(self.ctrl.get(lane)));
        // SAFETY: Caller ensures the lane is full, so its slot is initialized.
        unsafe { self.slots[lane].assume_init_mut() }
    }

    /// Store `key` in a vacant lane and mark it `Occupied(tag)`.
    #[inline(always)]
    pub(crate) fn write(&mut self, lane: usize, tag: u8, key: K) {
        debug_assert!(!is_full(self.ctrl.get(lane)));
        debug_assert!(is_full(tag));
        self.slots[lane].write(key);
        self.ctrl.set(lane, tag);
    }

    /// Move the key out of `lane`, leaving `vacated` (`EMPTY` or `DELETED`)
    /// as its control byte.
    ///
    /// # Safety
    ///
    /// The lane's control byte must be full.
    #[inline(always)]
    pub(crate) unsafe fn take(&mut self, lane: usize, vacated: u8) -> K {
        debug_assert!(is_full(self.ctrl.get(lane)));
        debug_assert!(!is_full(vacated));
        self.ctrl.set(lane, vacated);
        // SAFETY: Caller ensures the lane was full. The control byte no longer
        // claims the slot, so the value is read out exactly once.
        unsafe { self.slots[lane].assume_init_read() }
    }

    /// Drop every key and reset all lanes to `EMPTY`.
    pub(crate) fn clear(&mut self) {
        if core::mem::needs_drop::<K>() {
            for lane in 0..GROUP_WIDTH {
                if is_full(self.ctrl.get(lane)) {
                    self.ctrl.set(lane, EMPTY);
                    // SAFETY: The lane was full, so the slot is initialized. Its
                    // control byte is reset first so a panicking destructor
                    // cannot cause a second drop.
                    unsafe { self.slots[lane].assume_init_drop() };
                }
            }
        }
        self.ctrl = ControlBytes::EMPTY;
    }
}

impl<K: Clone> Clone for Group<K> {
    fn clone(&self) -> Self {
        let mut group = Self::new();
        for lane in 0..GROUP_WIDTH {
            let ctrl = self.ctrl.get(lane);
            if is_full(ctrl) {
                // SAFETY: The lane is full.
                let key = unsafe { self.key(lane) }.clone();
                group.write(lane, ctrl, key);
            } else {
                group.ctrl.set(lane, ctrl);
            }
        }
        group
    }
}

impl<K> Drop for Group<K> {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Allocate `count` groups with every lane `EMPTY`.
pub(crate) fn alloc_groups<K>(count: usize) -> alloc::boxed::Box<[Group<K>]> {
    debug_assert!(count > 0);
    (0..count).map(|_| Group::new()).collect()
}
