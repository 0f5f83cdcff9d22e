use alloc::boxed::Box;
use alloc::vec::Vec;
use core::borrow::Borrow;
use core::cell::Cell;
use core::fmt::Debug;
use core::hash::Hash;
use core::marker::PhantomData;
use core::ops::ControlFlow;

use rand::RngCore;
use rand::SeedableRng;
use rand::rngs::SmallRng;

use crate::control::BitMask;
use crate::control::ControlBytes;
use crate::control::DELETED;
use crate::control::DefaultMatcher;
use crate::control::EMPTY;
use crate::control::Matcher;
use crate::control::h1;
use crate::control::h2;
use crate::group::Group;
use crate::group::MAX_AVG_GROUP_LOAD;
use crate::group::alloc_groups;
use crate::hasher::DefaultHashBuilder;
use crate::hasher::ReseedableHasher;
use crate::hasher::entropy_seed;

/// Smallest group count whose element limit covers `capacity`.
#[inline(always)]
fn groups_for(capacity: usize) -> usize {
    capacity.div_ceil(MAX_AVG_GROUP_LOAD).max(1)
}

/// SplitMix64 finalizer, used to spread the iteration cursor over groups.
#[inline(always)]
fn mix(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

/// An open-addressing hash table of keys, organized in fixed-width groups.
///
/// Each group pairs `GROUP_WIDTH` control bytes with `GROUP_WIDTH` key slots.
/// A key's hash is split into H1, which picks the group a probe starts at,
/// and a 7-bit H2 tag stored in the control byte. Probes walk groups
/// circularly, using the [`Matcher`] `M` to find tag candidates and `EMPTY`
/// lanes in a whole group at a time, and stop at the first group with an
/// `EMPTY` lane.
///
/// The table owns its hasher and keys it from an internal random source at
/// construction and on every rehash.
///
/// ## Hash and equality
///
/// Keys that compare equal must hash equally. Violating this is a logic
/// error: the table stays memory-safe but lookups, removals and the
/// no-duplicates invariant are no longer reliable.
///
/// ## Example
///
/// ```rust
/// # #[cfg(any(feature = "std", feature = "foldhash"))]
/// # {
/// use swiss_set::HashTable;
///
/// let mut table: HashTable<u64> = HashTable::with_capacity(16);
/// assert!(table.add(7));
/// assert!(!table.add(7));
/// assert!(table.contains(&7));
/// assert!(table.remove(&7));
/// assert_eq!(table.len(), 0);
/// # }
/// ```
pub struct HashTable<K, S = DefaultHashBuilder, M = DefaultMatcher> {
    groups: Box<[Group<K>]>,
    hash_builder: S,
    rng: SmallRng,
    /// Advanced on every traversal; `mix` turns it into a start group.
    iter_cursor: Cell<u64>,

    /// Lanes that are not `EMPTY`: live keys plus tombstones.
    resident: usize,
    /// Tombstones (`DELETED` lanes).
    dead: usize,
    element_limit: usize,

    _matcher: PhantomData<fn() -> M>,
}

impl<K, S, M> Debug for HashTable<K, S, M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HashTable")
            .field(
                "groups",
                &self.groups.iter().map(|g| g.ctrl).collect::<Vec<_>>(),
            )
            .field("len", &self.len())
            .field("resident", &self.resident)
            .field("dead", &self.dead)
            .field("element_limit", &self.element_limit)
            .finish()
    }
}

impl<K, S, M> Clone for HashTable<K, S, M>
where
    K: Clone,
    S: Clone,
{
    fn clone(&self) -> Self {
        // Forked stream: the clone must not replay the original's reseeds.
        let mut rng = SmallRng::seed_from_u64(self.rng.clone().next_u64() ^ entropy_seed());
        let iter_cursor = Cell::new(rng.next_u64());
        Self {
            groups: self.groups.clone(),
            hash_builder: self.hash_builder.clone(),
            rng,
            iter_cursor,
            resident: self.resident,
            dead: self.dead,
            element_limit: self.element_limit,
            _matcher: PhantomData,
        }
    }
}

impl<K, S, M> HashTable<K, S, M> {
    /// Returns the number of keys in the table.
    pub fn len(&self) -> usize {
        self.resident - self.dead
    }

    /// Returns `true` if the table holds no keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns how many more keys can be added before the table grows.
    ///
    /// Tombstones count against this budget until the next rehash, and adding
    /// a key that is already present does not consume it.
    ///
    /// # Examples
    ///
    /// ```rust
    /// # #[cfg(any(feature = "std", feature = "foldhash"))]
    /// # {
    /// use swiss_set::HashTable;
    ///
    /// let mut table: HashTable<u32> = HashTable::with_capacity(100);
    /// let before = table.capacity();
    /// assert!(before >= 100);
    /// table.add(1);
    /// assert_eq!(table.capacity(), before - 1);
    /// # }
    /// ```
    pub fn capacity(&self) -> usize {
        self.element_limit - self.resident
    }

    /// Returns the number of groups currently allocated.
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Returns a reference to the table's hasher.
    pub fn hasher(&self) -> &S {
        &self.hash_builder
    }

    /// Removes every key, keeping the allocated groups.
    pub fn clear(&mut self) {
        if self.resident == 0 {
            return;
        }
        for group in self.groups.iter_mut() {
            group.clear();
        }
        self.resident = 0;
        self.dead = 0;
    }
}

impl<K, S, M> HashTable<K, S, M>
where
    M: Matcher,
{
    /// Returns an iterator over the keys.
    ///
    /// Each traversal starts at a randomly chosen group and wraps around, so
    /// the order differs between calls and carries no meaning. Every key is
    /// yielded exactly once.
    ///
    /// # Examples
    ///
    /// ```rust
    /// # #[cfg(any(feature = "std", feature = "foldhash"))]
    /// # {
    /// use swiss_set::HashTable;
    ///
    /// let mut table: HashTable<u32> = HashTable::new();
    /// table.add(1);
    /// table.add(2);
    ///
    /// let mut keys: Vec<u32> = table.iter().copied().collect();
    /// keys.sort();
    /// assert_eq!(keys, [1, 2]);
    /// # }
    /// ```
    pub fn iter(&self) -> Iter<'_, K> {
        Iter::new(&self.groups, self.random_group(), self.len(), M::match_full)
    }

    /// Visits every key until the visitor breaks.
    ///
    /// Returns [`ControlFlow::Break`] if the visitor stopped the traversal
    /// early.
    pub fn for_each_until(&self, visitor: impl FnMut(&K) -> ControlFlow<()>) -> ControlFlow<()> {
        self.iter().try_for_each(visitor)
    }

    /// Removes every key and returns them in an iterator.
    ///
    /// The table keeps its group count. Keys not consumed by the iterator are
    /// dropped with it.
    pub fn drain(&mut self) -> Drain<'_, K> {
        let group_count = self.groups.len();
        let groups = core::mem::replace(&mut self.groups, alloc_groups(group_count));
        let len = self.len();
        self.resident = 0;
        self.dead = 0;
        Drain {
            inner: IntoIter::new(groups, len, M::match_full),
            _table: PhantomData,
        }
    }

    fn random_group(&self) -> usize {
        let ticket = self.iter_cursor.get();
        self.iter_cursor.set(ticket.wrapping_add(1));
        (mix(ticket) % self.groups.len() as u64) as usize
    }
}

impl<K, S, M> HashTable<K, S, M>
where
    S: ReseedableHasher,
    M: Matcher,
{
    /// Creates an empty table using `hash_builder`.
    pub fn with_hasher(hash_builder: S) -> Self {
        Self::with_capacity_and_hasher(0, hash_builder)
    }

    /// Creates a table that can hold `capacity` keys without growing.
    ///
    /// The group count is the smallest that covers `capacity` at the maximum
    /// average group load, and never less than one.
    ///
    /// The table's random source is seeded from OS entropy under `std`.
    /// Without `std`, or if the OS read fails, it falls back to a weak
    /// address-derived seed; use
    /// [`with_capacity_hasher_and_seed`](Self::with_capacity_hasher_and_seed)
    /// to supply real entropy there.
    pub fn with_capacity_and_hasher(capacity: usize, hash_builder: S) -> Self {
        Self::with_capacity_hasher_and_seed(capacity, hash_builder, entropy_seed())
    }

    /// Like [`with_capacity_and_hasher`](Self::with_capacity_and_hasher), but
    /// seeds the table's random source explicitly.
    ///
    /// The random source keys the hasher and picks iteration start groups, so
    /// with a hasher that reseeds deterministically two tables built with the
    /// same seed and fed the same operations behave identically.
    pub fn with_capacity_hasher_and_seed(capacity: usize, mut hash_builder: S, seed: u64) -> Self {
        let mut rng = SmallRng::seed_from_u64(seed);
        hash_builder.reseed(rng.next_u64());
        let iter_cursor = Cell::new(rng.next_u64());

        let group_count = groups_for(capacity);
        Self {
            groups: alloc_groups(group_count),
            hash_builder,
            rng,
            iter_cursor,
            resident: 0,
            dead: 0,
            element_limit: group_count * MAX_AVG_GROUP_LOAD,
            _matcher: PhantomData,
        }
    }
}

impl<K, S, M> HashTable<K, S, M>
where
    S: ReseedableHasher + Default,
    M: Matcher,
{
    /// Creates an empty table with the default hasher.
    pub fn new() -> Self {
        Self::with_hasher(S::default())
    }

    /// Creates a table that can hold `capacity` keys without growing, using
    /// the default hasher.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_hasher(capacity, S::default())
    }
}

impl<K, S, M> Default for HashTable<K, S, M>
where
    S: ReseedableHasher + Default,
    M: Matcher,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, S, M> HashTable<K, S, M>
where
    K: Hash + Eq,
    S: ReseedableHasher,
    M: Matcher,
{
    #[inline(always)]
    fn home_group(&self, hash: u64) -> usize {
        (h1(hash) % self.groups.len() as u64) as usize
    }

    #[inline(always)]
    fn next_group(&self, group: usize) -> usize {
        let next = group + 1;
        if next == self.groups.len() { 0 } else { next }
    }

    /// Adds `key` to the table.
    ///
    /// Returns `true` if the key was not present. Adding a key that is already
    /// present leaves the stored key untouched and returns `false`.
    ///
    /// If the table is at its element limit it is rehashed first, even when
    /// the key turns out to be a duplicate.
    pub fn add(&mut self, key: K) -> bool {
        if self.resident >= self.element_limit {
            self.rehash(self.next_size());
        }

        let hash = self.hash_builder.hash_one(&key);
        let tag = h2(hash);
        let mut index = self.home_group(hash);

        // Terminates: `resident < element_limit < groups * GROUP_WIDTH`, so
        // some group still has an EMPTY lane.
        loop {
            let group = &mut self.groups[index];
            for lane in M::match_tag(&group.ctrl, tag) {
                // SAFETY: A tag match means the lane is full.
                if unsafe { group.key(lane) } == &key {
                    return false;
                }
            }

            if let Some(lane) = M::match_empty(&group.ctrl).lowest() {
                group.write(lane, tag, key);
                self.resident += 1;
                debug_assert!(self.resident <= self.element_limit);
                return true;
            }

            index = self.next_group(index);
        }
    }

    /// Adds `key`, replacing and returning an equal key already present.
    pub fn replace(&mut self, key: K) -> Option<K> {
        if !self.is_empty() {
            if let Some((index, lane)) = self.find(self.hash_builder.hash_one(&key), &key) {
                // SAFETY: `find` only returns full lanes. The replacement is
                // equal to the old key, so it hashes to the same tag.
                let slot = unsafe { self.groups[index].key_mut(lane) };
                return Some(core::mem::replace(slot, key));
            }
        }
        self.add(key);
        None
    }

    /// Returns `true` if the table contains `key`.
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.get(key).is_some()
    }

    /// Returns the stored key equal to `key`, if any.
    pub fn get<Q>(&self, key: &Q) -> Option<&K>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        if self.is_empty() {
            return None;
        }

        let (index, lane) = self.find(self.hash_builder.hash_one(key), key)?;
        // SAFETY: `find` only returns full lanes.
        Some(unsafe { self.groups[index].key(lane) })
    }

    /// Removes `key` from the table. Returns whether it was present.
    pub fn remove<Q>(&mut self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.take(key).is_some()
    }

    /// Removes `key` from the table and returns the stored key.
    pub fn take<Q>(&mut self, key: &Q) -> Option<K>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        if self.is_empty() {
            return None;
        }

        let (index, lane) = self.find(self.hash_builder.hash_one(key), key)?;
        // SAFETY: `find` only returns full lanes.
        Some(unsafe { self.erase(index, lane) })
    }

    /// Keeps only the keys for which `f` returns `true`.
    ///
    /// This is the supported way to remove keys while walking the table.
    pub fn retain(&mut self, mut f: impl FnMut(&K) -> bool) {
        for index in 0..self.groups.len() {
            for lane in M::match_full(&self.groups[index].ctrl) {
                // SAFETY: The lane is in the group's full mask and nothing
                // before it in this loop touched it.
                if !f(unsafe { self.groups[index].key(lane) }) {
                    // SAFETY: As above.
                    drop(unsafe { self.erase(index, lane) });
                }
            }
        }
    }

    /// Visits every key and lets the visitor queue new keys.
    ///
    /// Keys passed to [`Additions::add`] are added to the table once the
    /// traversal ends, whether it ran to completion or was broken off. They
    /// are never visited by the traversal that queued them.
    ///
    /// # Examples
    ///
    /// ```rust
    /// # #[cfg(any(feature = "std", feature = "foldhash"))]
    /// # {
    /// use core::ops::ControlFlow;
    ///
    /// use swiss_set::HashTable;
    ///
    /// let mut table: HashTable<u32> = HashTable::new();
    /// table.add(1);
    /// table.add(2);
    ///
    /// let mut visited = 0;
    /// table.for_each_adding(|&key, additions| {
    ///     visited += 1;
    ///     additions.add(key + 10);
    ///     ControlFlow::Continue(())
    /// });
    /// assert_eq!(visited, 2);
    /// assert!(table.contains(&11) && table.contains(&12));
    /// # }
    /// ```
    pub fn for_each_adding(
        &mut self,
        mut visitor: impl FnMut(&K, &mut Additions<K>) -> ControlFlow<()>,
    ) -> ControlFlow<()> {
        let mut additions = Additions {
            pending: Vec::new(),
        };
        let flow = self
            .iter()
            .try_for_each(|key| visitor(key, &mut additions));

        for key in additions.pending {
            self.add(key);
        }
        flow
    }

    /// Ensures at least `additional` more keys can be added without growing.
    pub fn reserve(&mut self, additional: usize) {
        if self.capacity() >= additional {
            return;
        }
        let required = self
            .len()
            .checked_add(additional)
            .expect("capacity overflow");
        self.rehash(groups_for(required).max(self.groups.len()));
    }

    /// Rehashes into the fewest groups that hold the current keys.
    pub fn shrink_to_fit(&mut self) {
        let group_count = groups_for(self.len());
        if group_count < self.groups.len() {
            self.rehash(group_count);
        }
    }

    fn find<Q>(&self, hash: u64, key: &Q) -> Option<(usize, usize)>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let tag = h2(hash);
        let mut index = self.home_group(hash);

        for _ in 0..self.groups.len() {
            let group = &self.groups[index];
            for lane in M::match_tag(&group.ctrl, tag) {
                // SAFETY: A tag match means the lane is full.
                let stored: &K = unsafe { group.key(lane) };
                if Borrow::<Q>::borrow(stored) == key {
                    return Some((index, lane));
                }
            }

            // Had the key been added, it would have taken an EMPTY lane here
            // rather than moving on.
            if M::match_empty(&group.ctrl).any() {
                return None;
            }

            index = self.next_group(index);
        }

        None
    }

    /// Move the key out of a full lane and vacate it.
    ///
    /// A lane may go straight back to `EMPTY` only when its group already has
    /// an `EMPTY` lane: every probe reaching this group stops here anyway, so
    /// no later key can depend on probing past it. Otherwise it becomes a
    /// tombstone.
    ///
    /// # Safety
    ///
    /// `lane` of group `index` must be full.
    unsafe fn erase(&mut self, index: usize, lane: usize) -> K {
        let group = &mut self.groups[index];
        let vacated = if M::match_empty(&group.ctrl).any() {
            EMPTY
        } else {
            DELETED
        };

        // SAFETY: Caller ensures the lane is full.
        let key = unsafe { group.take(lane, vacated) };
        if vacated == EMPTY {
            self.resident -= 1;
        } else {
            self.dead += 1;
        }
        debug_assert!(self.dead <= self.resident);
        key
    }

    /// Group count for the next rehash: the same when at least half of the
    /// resident lanes are tombstones, double otherwise.
    fn next_size(&self) -> usize {
        let group_count = self.groups.len();
        if self.dead >= self.resident / 2 {
            group_count
        } else {
            group_count.checked_mul(2).expect("capacity overflow")
        }
    }

    #[cold]
    #[inline(never)]
    fn rehash(&mut self, group_count: usize) {
        debug_assert!(groups_for(self.len()) <= group_count);

        let old_groups = core::mem::replace(&mut self.groups, alloc_groups(group_count));
        self.hash_builder.reseed(self.rng.next_u64());
        self.resident = 0;
        self.dead = 0;
        self.element_limit = group_count * MAX_AVG_GROUP_LOAD;

        // Keys in the old table are already unique, so each one only needs an
        // EMPTY lane.
        for mut group in old_groups.into_vec() {
            for lane in M::match_full(&group.ctrl) {
                // SAFETY: The lane is in the group's full mask.
                let key = unsafe { group.take(lane, EMPTY) };
                let hash = self.hash_builder.hash_one(&key);
                self.insert_unique(hash, key);
            }
        }
    }

    fn insert_unique(&mut self, hash: u64, key: K) {
        let tag = h2(hash);
        let mut index = self.home_group(hash);
        loop {
            let group = &mut self.groups[index];
            if let Some(lane) = M::match_empty(&group.ctrl).lowest() {
                group.write(lane, tag, key);
                self.resident += 1;
                return;
            }
            index = self.next_group(index);
        }
    }

    /// Counts keys by how many groups past their home group they are stored.
    ///
    /// Bin `d` of the result holds the keys found `d` groups after the group
    /// their H1 selects.
    #[cfg(any(test, feature = "stats"))]
    pub fn probe_histogram(&self) -> crate::stats::ProbeHistogram {
        let group_count = self.groups.len();
        let mut bins = alloc::vec![0usize; group_count];
        for (index, group) in self.groups.iter().enumerate() {
            for lane in M::match_full(&group.ctrl) {
                // SAFETY: The lane is in the group's full mask.
                let hash = self.hash_builder.hash_one(unsafe { group.key(lane) });
                let distance = (index + group_count - self.home_group(hash)) % group_count;
                bins[distance] += 1;
            }
        }

        while bins.len() > 1 && bins.last() == Some(&0) {
            bins.pop();
        }
        crate::stats::ProbeHistogram { bins }
    }

    /// Returns occupancy and memory statistics for the table.
    #[cfg(any(test, feature = "stats"))]
    pub fn debug_stats(&self) -> crate::stats::DebugStats {
        let total_slots = self.groups.len() * crate::group::GROUP_WIDTH;
        crate::stats::DebugStats {
            len: self.len(),
            resident: self.resident,
            dead: self.dead,
            group_count: self.groups.len(),
            element_limit: self.element_limit,
            total_slots,
            load_factor: self.resident as f64 / total_slots as f64,
            total_bytes: self.groups.len() * core::mem::size_of::<Group<K>>(),
        }
    }
}

impl<K, S, M> IntoIterator for HashTable<K, S, M>
where
    M: Matcher,
{
    type IntoIter = IntoIter<K>;
    type Item = K;

    fn into_iter(self) -> Self::IntoIter {
        let len = self.len();
        IntoIter::new(self.groups, len, M::match_full)
    }
}

impl<'a, K, S, M> IntoIterator for &'a HashTable<K, S, M>
where
    M: Matcher,
{
    type IntoIter = Iter<'a, K>;
    type Item = &'a K;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Keys queued by a [`HashTable::for_each_adding`] visitor.
pub struct Additions<K> {
    pending: Vec<K>,
}

impl<K> Additions<K> {
    /// Queue `key` to be added when the traversal ends.
    pub fn add(&mut self, key: K) {
        self.pending.push(key);
    }

    /// Number of keys queued so far.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Returns `true` if nothing has been queued.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// An iterator over the keys of a [`HashTable`].
///
/// This struct is created by [`HashTable::iter`].
pub struct Iter<'a, K> {
    groups: &'a [Group<K>],
    group: usize,
    groups_left: usize,
    lanes: BitMask,
    items_left: usize,
    full: fn(&ControlBytes) -> BitMask,
}

impl<'a, K> Iter<'a, K> {
    fn new(
        groups: &'a [Group<K>],
        start: usize,
        len: usize,
        full: fn(&ControlBytes) -> BitMask,
    ) -> Self {
        Self {
            groups,
            group: start,
            groups_left: groups.len() - 1,
            lanes: full(&groups[start].ctrl),
            items_left: len,
            full,
        }
    }
}

impl<K> Clone for Iter<'_, K> {
    fn clone(&self) -> Self {
        Self {
            groups: self.groups,
            group: self.group,
            groups_left: self.groups_left,
            lanes: self.lanes,
            items_left: self.items_left,
            full: self.full,
        }
    }
}

impl<'a, K> Iterator for Iter<'a, K> {
    type Item = &'a K;

    fn next(&mut self) -> Option<Self::Item> {
        let groups: &'a [Group<K>] = self.groups;
        while self.items_left > 0 {
            if let Some(lane) = self.lanes.next() {
                self.items_left -= 1;
                // SAFETY: `lanes` is the full mask of the current group, and the
                // shared borrow of the table keeps it unchanged.
                return Some(unsafe { groups[self.group].key(lane) });
            }

            if self.groups_left == 0 {
                break;
            }
            self.groups_left -= 1;
            self.group += 1;
            if self.group == groups.len() {
                self.group = 0;
            }
            self.lanes = (self.full)(&groups[self.group].ctrl);
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.items_left, Some(self.items_left))
    }
}

impl<K> ExactSizeIterator for Iter<'_, K> {}

impl<K> core::iter::FusedIterator for Iter<'_, K> {}

/// An owning iterator over the keys of a [`HashTable`].
pub struct IntoIter<K> {
    groups: alloc::vec::IntoIter<Group<K>>,
    current: Option<Group<K>>,
    lanes: BitMask,
    items_left: usize,
    full: fn(&ControlBytes) -> BitMask,
}

impl<K> IntoIter<K> {
    fn new(groups: Box<[Group<K>]>, len: usize, full: fn(&ControlBytes) -> BitMask) -> Self {
        Self {
            groups: groups.into_vec().into_iter(),
            current: None,
            lanes: BitMask::new(0),
            items_left: len,
            full,
        }
    }
}

impl<K> Iterator for IntoIter<K> {
    type Item = K;

    fn next(&mut self) -> Option<Self::Item> {
        while self.items_left > 0 {
            if let Some(group) = self.current.as_mut() {
                if let Some(lane) = self.lanes.next() {
                    self.items_left -= 1;
                    // SAFETY: `lanes` is the full mask of `group`, and each lane is
                    // taken at most once.
                    return Some(unsafe { group.take(lane, EMPTY) });
                }
            }

            let group = self.groups.next()?;
            self.lanes = (self.full)(&group.ctrl);
            self.current = Some(group);
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.items_left, Some(self.items_left))
    }
}

impl<K> ExactSizeIterator for IntoIter<K> {}

/// A draining iterator over the keys of a [`HashTable`].
///
/// This struct is created by [`HashTable::drain`]. The table is already
/// empty when it is returned; dropping the iterator drops the remaining keys.
pub struct Drain<'a, K> {
    inner: IntoIter<K>,
    _table: PhantomData<&'a mut ()>,
}

impl<K> Iterator for Drain<'_, K> {
    type Item = K;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl<K> ExactSizeIterator for Drain<'_, K> {}

#[cfg(test)]
mod tests {
    use alloc::collections::BTreeSet;
    use alloc::rc::Rc;
    use alloc::string::String;
    use alloc::string::ToString;
    use alloc::vec;
    use core::hash::BuildHasher;
    use core::hash::BuildHasherDefault;
    use core::hash::Hasher;

    use rand::Rng;

    use super::*;
    use crate::group::GROUP_WIDTH;
    use crate::hasher::tests::SipHashBuilder;

    /// Hashes a `u64` key to itself, so tests can place keys in chosen
    /// groups and lanes.
    #[derive(Default)]
    struct IdentityHasher(u64);

    impl Hasher for IdentityHasher {
        fn finish(&self) -> u64 {
            self.0
        }

        fn write(&mut self, _bytes: &[u8]) {
            unimplemented!("identity hashing only supports u64 keys")
        }

        fn write_u64(&mut self, n: u64) {
            self.0 = n;
        }
    }

    /// Every key hashes the same.
    #[derive(Default)]
    struct ConstantHasher;

    impl Hasher for ConstantHasher {
        fn finish(&self) -> u64 {
            0
        }

        fn write(&mut self, _bytes: &[u8]) {}
    }

    /// Identity hashing XORed with a key that `reseed` replaces, so keys can
    /// be placed and reseeding still shows.
    #[derive(Clone, Debug, PartialEq, Eq)]
    struct XorKeyed(u64);

    struct XorHasher {
        key: u64,
        state: u64,
    }

    impl Hasher for XorHasher {
        fn finish(&self) -> u64 {
            self.state ^ self.key
        }

        fn write(&mut self, _bytes: &[u8]) {
            unimplemented!("xor hashing only supports u64 keys")
        }

        fn write_u64(&mut self, n: u64) {
            self.state = n;
        }
    }

    impl BuildHasher for XorKeyed {
        type Hasher = XorHasher;

        fn build_hasher(&self) -> XorHasher {
            XorHasher {
                key: self.0,
                state: 0,
            }
        }
    }

    impl ReseedableHasher for XorKeyed {
        fn reseed(&mut self, seed: u64) {
            self.0 = seed;
        }
    }

    type SipTable<K> = HashTable<K, SipHashBuilder>;
    type IdentityTable = HashTable<u64, BuildHasherDefault<IdentityHasher>>;

    /// Identity-hashed key with the given H1 and tag.
    fn placed(group_h1: u64, tag: u64) -> u64 {
        (group_h1 << 7) | tag
    }

    fn assert_invariants<K: Hash + Eq + Clone + Ord, S: ReseedableHasher, M: Matcher>(
        table: &HashTable<K, S, M>,
    ) {
        assert!(table.dead <= table.resident, "{table:?}");
        assert!(table.resident <= table.element_limit, "{table:?}");
        assert!(table.group_count() >= 1);

        let keys: Vec<K> = table.iter().cloned().collect();
        assert_eq!(keys.len(), table.len(), "{table:?}");
        let unique: BTreeSet<K> = keys.into_iter().collect();
        assert_eq!(unique.len(), table.len(), "duplicate keys: {table:?}");

        let mut full = 0;
        let mut deleted = 0;
        for group in table.groups.iter() {
            for &ctrl in group.ctrl.as_bytes() {
                match ctrl {
                    EMPTY => {}
                    DELETED => deleted += 1,
                    _ => full += 1,
                }
            }
        }
        assert_eq!(full, table.len());
        assert_eq!(deleted, table.dead);
    }

    #[test]
    fn zero_capacity_has_one_group() {
        let table: SipTable<u64> = HashTable::with_capacity(0);
        assert_eq!(table.group_count(), 1);
        assert_eq!(table.capacity(), MAX_AVG_GROUP_LOAD);
        assert!(table.is_empty());
        assert!(!table.contains(&0));
        assert_eq!(table.iter().count(), 0);
    }

    #[test]
    fn capacity_is_rounded_to_whole_groups() {
        for requested in [1, MAX_AVG_GROUP_LOAD, MAX_AVG_GROUP_LOAD + 1, 100, 1000] {
            let table: SipTable<u64> = HashTable::with_capacity(requested);
            assert!(table.capacity() >= requested);
            assert!(table.capacity() < requested + MAX_AVG_GROUP_LOAD);
            assert_eq!(table.capacity(), table.group_count() * MAX_AVG_GROUP_LOAD);
        }
    }

    #[test]
    fn count_plus_capacity_matches_request_until_growth() {
        let requested = MAX_AVG_GROUP_LOAD * 5;
        let mut table: SipTable<u64> = HashTable::with_capacity(requested);
        assert_eq!(table.len() + table.capacity(), requested);
        for k in 0..requested as u64 {
            assert!(table.add(k));
            assert_eq!(table.len() + table.capacity(), requested);
        }
        assert_eq!(table.group_count(), 5);
    }

    #[test]
    fn fills_one_group_then_doubles() {
        let mut table: SipTable<u64> = HashTable::with_capacity(0);
        for k in 0..MAX_AVG_GROUP_LOAD as u64 {
            assert!(table.add(k));
        }
        assert_eq!(table.group_count(), 1);
        assert_eq!(table.capacity(), 0);

        assert!(table.add(1_000));
        assert_eq!(table.group_count(), 2);
        for k in 0..MAX_AVG_GROUP_LOAD as u64 {
            assert!(table.contains(&k), "{k} lost in growth: {table:?}");
        }
        assert!(table.contains(&1_000));
        assert_eq!(table.len(), MAX_AVG_GROUP_LOAD + 1);
        assert_invariants(&table);
    }

    #[test]
    fn add_is_idempotent() {
        let mut table: SipTable<String> = HashTable::with_capacity(0);
        assert!(table.add("a".to_string()));
        assert!(!table.add("a".to_string()));
        assert_eq!(table.len(), 1);
        assert!(table.contains("a"));
        assert_eq!(table.get("a").map(String::as_str), Some("a"));
    }

    #[test]
    fn remove_in_group_with_empty_lane_clears_to_empty() {
        let mut table: IdentityTable = HashTable::with_capacity(0);
        let key = placed(0, 0x21);
        table.add(key);
        assert_eq!(table.groups[0].ctrl.get(0), 0x21);

        assert!(table.remove(&key));
        assert_eq!(table.groups[0].ctrl.get(0), EMPTY);
        assert_eq!(table.dead, 0);
        assert_eq!(table.resident, 0);
        assert!(!table.contains(&key));
        assert!(!table.remove(&key));
    }

    fn fill_group_zero(table: &mut IdentityTable) -> Vec<u64> {
        assert_eq!(table.group_count(), 2);
        // Even H1 values all start probing at group 0 of two.
        let keys: Vec<u64> = (0..GROUP_WIDTH as u64).map(|j| placed(2 * j, j)).collect();
        for &key in &keys {
            assert!(table.add(key));
        }
        assert!(
            !DefaultMatcher::match_empty(&table.groups[0].ctrl).any(),
            "{table:?}"
        );
        keys
    }

    #[test]
    fn remove_in_full_group_leaves_tombstone() {
        let mut table: IdentityTable = HashTable::with_capacity(2 * MAX_AVG_GROUP_LOAD);
        let keys = fill_group_zero(&mut table);
        let resident = table.resident;

        assert!(table.remove(&keys[3]));
        assert_eq!(table.groups[0].ctrl.get(3), DELETED);
        assert_eq!(table.dead, 1);
        assert_eq!(table.resident, resident);
        assert_eq!(table.len(), GROUP_WIDTH - 1);
        assert!(!table.contains(&keys[3]));
        for &key in keys.iter().filter(|&&k| k != keys[3]) {
            assert!(table.contains(&key));
        }

        // A further removal in the still EMPTY-less group is a tombstone too.
        assert!(table.remove(&keys[0]));
        assert_eq!(table.groups[0].ctrl.get(0), DELETED);
        assert_eq!(table.dead, 2);
        assert_invariants(&table);
    }

    #[test]
    fn probes_continue_past_full_group() {
        let mut table: IdentityTable = HashTable::with_capacity(2 * MAX_AVG_GROUP_LOAD);
        let keys = fill_group_zero(&mut table);
        table.remove(&keys[1]);

        // Homed at group 0, which has no EMPTY lane, so it lands in group 1.
        let spill = placed(2 * GROUP_WIDTH as u64, 0x7f);
        assert!(table.add(spill));
        assert_eq!(table.groups[0].ctrl.get(1), DELETED);
        assert_eq!(table.groups[1].ctrl.get(0), 0x7f);
        assert!(table.contains(&spill));
        assert_eq!(table.probe_histogram().bins, vec![GROUP_WIDTH - 1, 1]);

        // Removing from group 1, which has EMPTY lanes, does not tombstone.
        assert!(table.remove(&spill));
        assert_eq!(table.groups[1].ctrl.get(0), EMPTY);
        assert_eq!(table.dead, 1);
    }

    #[test]
    fn tombstone_heavy_table_rehashes_in_place() {
        let mut table: IdentityTable = HashTable::with_capacity(2 * MAX_AVG_GROUP_LOAD);
        let keys = fill_group_zero(&mut table);
        for key in &keys {
            assert!(table.remove(key));
        }
        assert_eq!(table.dead, GROUP_WIDTH);
        assert_eq!(table.len(), 0);

        // Odd H1 values start at group 1.
        let mut extra = Vec::new();
        let mut j = 0u64;
        while table.capacity() > 0 {
            let key = placed(2 * j + 1, j & 0x7f);
            assert!(table.add(key));
            extra.push(key);
            j += 1;
        }
        assert_eq!(table.group_count(), 2);

        let last = placed(2 * j + 1, 0x33);
        assert!(table.add(last));
        assert_eq!(table.group_count(), 2, "should compact, not grow");
        assert_eq!(table.dead, 0);
        assert_eq!(table.len(), extra.len() + 1);
        for key in extra.iter().chain([&last]) {
            assert!(table.contains(key));
        }
        for key in &keys {
            assert!(!table.contains(key));
        }
        assert_invariants(&table);
    }

    #[test]
    fn growth_rehash_reseeds_the_hasher() {
        let mut table: SipTable<u64> =
            HashTable::with_capacity_hasher_and_seed(0, SipHashBuilder::default(), 42);
        let sample = [1u64, 2, 3, 0xdead_beef];
        let keyed = table.hasher().clone();
        let before: Vec<u64> = sample.iter().map(|k| table.hasher().hash_one(k)).collect();

        for k in 0..=MAX_AVG_GROUP_LOAD as u64 {
            assert!(table.add(k));
        }
        assert_eq!(table.group_count(), 2);

        assert_ne!(table.hasher(), &keyed);
        let after: Vec<u64> = sample.iter().map(|k| table.hasher().hash_one(k)).collect();
        assert_ne!(before, after);
        for k in 0..=MAX_AVG_GROUP_LOAD as u64 {
            assert!(table.contains(&k));
        }
        assert_invariants(&table);
    }

    #[test]
    fn in_place_rehash_reseeds_the_hasher() {
        let mut table: HashTable<u64, XorKeyed> =
            HashTable::with_capacity_hasher_and_seed(2 * MAX_AVG_GROUP_LOAD, XorKeyed(0), 7);
        let key = table.hasher().0;

        // Even H1 values start at group 0 of two, odd ones at group 1.
        let doomed: Vec<u64> = (0..GROUP_WIDTH as u64)
            .map(|j| placed(2 * j, j) ^ key)
            .collect();
        for k in &doomed {
            assert!(table.add(*k));
        }
        for k in &doomed {
            assert!(table.remove(k));
        }
        assert_eq!(table.dead, GROUP_WIDTH);

        let mut kept = Vec::new();
        let mut j = 0u64;
        while table.capacity() > 0 {
            let k = placed(2 * j + 1, j & 0x7f) ^ key;
            assert!(table.add(k));
            kept.push(k);
            j += 1;
        }
        let sample = kept[0];
        let before = table.hasher().hash_one(sample);

        let last = placed(2 * j + 1, 0x21) ^ key;
        assert!(table.add(last));
        assert_eq!(table.group_count(), 2);
        assert_eq!(table.dead, 0);

        assert_ne!(table.hasher().0, key);
        assert_ne!(table.hasher().hash_one(sample), before);
        for k in kept.iter().chain([&last]) {
            assert!(table.contains(k));
        }
        assert_invariants(&table);
    }

    #[test]
    fn delete_then_readd() {
        let mut table: SipTable<u64> = HashTable::with_capacity(0);
        for k in 0..100 {
            table.add(k);
        }
        let before = table.len();
        assert!(table.remove(&42));
        assert_eq!(table.len(), before - 1);
        assert!(table.add(42));
        assert!(table.contains(&42));
        assert_eq!(table.len(), before);
    }

    #[test]
    fn clear_resets_fully() {
        let mut table: SipTable<u64> = HashTable::with_capacity(0);
        for k in 0..500 {
            table.add(k);
        }
        for k in (0..500).step_by(3) {
            table.remove(&k);
        }
        let groups = table.group_count();

        table.clear();
        assert_eq!(table.len(), 0);
        assert_eq!(table.dead, 0);
        assert_eq!(table.group_count(), groups);
        assert_eq!(table.capacity(), groups * MAX_AVG_GROUP_LOAD);
        assert_eq!(table.iter().count(), 0);
        for k in 0..500 {
            assert!(!table.contains(&k));
        }
        assert!(
            table
                .groups
                .iter()
                .all(|g| g.ctrl == ControlBytes::EMPTY)
        );
    }

    #[test]
    fn iteration_visits_each_key_once() {
        let mut table: SipTable<u64> = HashTable::with_capacity(0);
        for k in 0..1000 {
            table.add(k);
        }
        for k in (0..1000).step_by(7) {
            table.remove(&k);
        }

        let expected: BTreeSet<u64> = (0..1000).filter(|k| k % 7 != 0).collect();
        for _ in 0..8 {
            let mut seen = BTreeSet::new();
            for &k in table.iter() {
                assert!(seen.insert(k), "{k} visited twice");
            }
            assert_eq!(seen, expected);
        }
        assert_eq!(table.iter().len(), expected.len());
    }

    #[test]
    fn iteration_start_varies() {
        let mut table: SipTable<u64> = HashTable::with_capacity(64 * MAX_AVG_GROUP_LOAD);
        for k in 0..(32 * MAX_AVG_GROUP_LOAD) as u64 {
            table.add(k);
        }
        let firsts: BTreeSet<u64> = (0..64).map(|_| *table.iter().next().unwrap()).collect();
        assert!(firsts.len() > 1, "iteration always starts at the same key");
    }

    #[test]
    fn for_each_until_stops_early() {
        let mut table: SipTable<u64> = HashTable::with_capacity(0);
        for k in 0..100 {
            table.add(k);
        }

        let mut visited = 0;
        let flow = table.for_each_until(|_| {
            visited += 1;
            if visited == 10 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });
        assert_eq!(flow, ControlFlow::Break(()));
        assert_eq!(visited, 10);

        let mut all = 0;
        let flow = table.for_each_until(|_| {
            all += 1;
            ControlFlow::Continue(())
        });
        assert_eq!(flow, ControlFlow::Continue(()));
        assert_eq!(all, 100);
    }

    #[test]
    fn additions_during_iteration_apply_on_return() {
        let mut table: SipTable<u64> = HashTable::with_capacity(0);
        for k in 0..50 {
            table.add(k);
        }

        // Doubling the key count forces at least one rehash when applied.
        let mut visited = BTreeSet::new();
        let flow = table.for_each_adding(|&k, additions| {
            visited.insert(k);
            additions.add(k + 1_000);
            additions.add(k);
            ControlFlow::Continue(())
        });
        assert_eq!(flow, ControlFlow::Continue(()));
        assert_eq!(visited, (0..50).collect());
        assert_eq!(table.len(), 100);
        for k in 0..50 {
            assert!(table.contains(&k));
            assert!(table.contains(&(k + 1_000)));
        }
        assert_invariants(&table);
    }

    #[test]
    fn additions_survive_early_stop() {
        let mut table: SipTable<u64> = HashTable::with_capacity(0);
        table.add(1);
        table.add(2);
        let flow = table.for_each_adding(|_, additions| {
            additions.add(99);
            assert_eq!(additions.len(), 1);
            ControlFlow::Break(())
        });
        assert_eq!(flow, ControlFlow::Break(()));
        assert!(table.contains(&99));
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn retain_removes_while_walking() {
        let mut table: SipTable<u64> = HashTable::with_capacity(0);
        for k in 0..300 {
            table.add(k);
        }
        table.retain(|k| k % 2 == 0);
        assert_eq!(table.len(), 150);
        for k in 0..300 {
            assert_eq!(table.contains(&k), k % 2 == 0);
        }
        assert_invariants(&table);
    }

    #[test]
    fn matches_model_under_random_operations() {
        let mut rng = SmallRng::seed_from_u64(0x0dd_ba11);
        let mut table: SipTable<u64> = HashTable::with_capacity(0);
        let mut model = BTreeSet::new();

        for step in 0..20_000 {
            let key = rng.random_range(0..512u64);
            match rng.random_range(0..10) {
                0..=4 => assert_eq!(table.add(key), model.insert(key)),
                5..=7 => assert_eq!(table.remove(&key), model.remove(&key)),
                8 => assert_eq!(table.contains(&key), model.contains(&key)),
                _ => {
                    if step % 1000 == 0 {
                        table.clear();
                        model.clear();
                    }
                }
            }
            assert_eq!(table.len(), model.len());
        }

        for key in 0..512 {
            assert_eq!(table.contains(&key), model.contains(&key));
        }
        assert_invariants(&table);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn no_duplicates_across_many_rehashes() {
        let mut rng = SmallRng::seed_from_u64(7);
        let mut table: SipTable<u64> = HashTable::with_capacity(0);
        for round in 0..20 {
            for _ in 0..2_000 {
                table.add(rng.random_range(0..4_096));
            }
            assert_invariants(&table);
            table.retain(|k| (k + round) % 3 != 0);
            assert_invariants(&table);
        }
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn insert_many() {
        let mut table: SipTable<u64> = HashTable::with_capacity(0);
        for k in 0..100_000u64 {
            assert!(table.add(k));
        }
        assert_eq!(table.len(), 100_000);
        for k in 0..100_000u64 {
            assert!(table.contains(&k));
        }
        assert!(!table.contains(&100_000));
    }

    #[test]
    fn explicit_collision() {
        let mut table: HashTable<u64, BuildHasherDefault<ConstantHasher>> =
            HashTable::with_capacity(0);
        for k in 0..65u64 {
            assert!(table.add(k));
        }
        assert_eq!(table.len(), 65);
        for k in 0..65u64 {
            assert!(table.contains(&k), "{table:?}");
        }
        for k in 0..65u64 {
            assert!(table.remove(&k));
        }
        assert!(table.is_empty());
    }

    #[test]
    fn seeded_tables_behave_identically() {
        let build = || {
            let mut table: SipTable<u64> =
                HashTable::with_capacity_hasher_and_seed(0, SipHashBuilder::default(), 1234);
            for k in 0..300 {
                table.add(k);
            }
            table
        };
        let a = build();
        let b = build();
        assert_eq!(
            a.iter().copied().collect::<Vec<_>>(),
            b.iter().copied().collect::<Vec<_>>()
        );
    }

    #[test]
    fn drain_and_into_iter() {
        let mut table: SipTable<String> = HashTable::with_capacity(0);
        for k in 0..40 {
            table.add(k.to_string());
        }
        let groups = table.group_count();

        let drained: BTreeSet<String> = table.drain().collect();
        assert_eq!(drained.len(), 40);
        assert!(table.is_empty());
        assert_eq!(table.group_count(), groups);

        for k in 0..10 {
            table.add(k.to_string());
        }
        table.remove("3");
        let owned: BTreeSet<String> = table.into_iter().collect();
        assert_eq!(owned.len(), 9);
        assert!(!owned.contains("3"));
    }

    #[test]
    fn keys_are_dropped_exactly_once() {
        let tracked = Rc::new(());
        {
            let mut table: SipTable<(u64, Rc<()>)> = HashTable::with_capacity(0);
            for k in 0..100 {
                table.add((k, tracked.clone()));
            }
            assert_eq!(Rc::strong_count(&tracked), 101);

            for k in 0..30 {
                assert!(table.remove(&(k, tracked.clone())));
            }
            assert_eq!(Rc::strong_count(&tracked), 71);

            let mut drain = table.drain();
            drop(drain.next());
            drop(drain);
            assert_eq!(Rc::strong_count(&tracked), 1);

            for k in 0..20 {
                table.add((k, tracked.clone()));
            }
            let partial = table.clone().into_iter().take(5).count();
            assert_eq!(partial, 5);
            assert_eq!(Rc::strong_count(&tracked), 21);
        }
        assert_eq!(Rc::strong_count(&tracked), 1);
    }

    #[test]
    fn clone_is_independent() {
        let mut table: SipTable<u64> = HashTable::with_capacity(0);
        for k in 0..64 {
            table.add(k);
        }
        table.remove(&5);
        let mut copy = table.clone();
        copy.add(1_000);
        copy.remove(&6);

        assert!(table.contains(&6) && !table.contains(&1_000));
        assert!(!copy.contains(&6) && copy.contains(&1_000));
        assert_eq!(copy.len(), table.len());
        assert_invariants(&copy);

        // Both rehash; the clone must not replay the original's hasher keys.
        let mut twin = table.clone();
        assert_eq!(twin.hasher(), table.hasher());
        table.reserve(1_000);
        twin.reserve(1_000);
        assert_ne!(twin.hasher(), table.hasher());
        assert_eq!(twin.len(), table.len());
        assert_invariants(&twin);
    }

    #[test]
    fn reserve_and_shrink() {
        let mut table: SipTable<u64> = HashTable::with_capacity(0);
        table.reserve(1_000);
        assert!(table.capacity() >= 1_000);
        let groups = table.group_count();
        for k in 0..1_000 {
            table.add(k);
        }
        assert_eq!(table.group_count(), groups);

        table.retain(|&k| k < 10);
        table.shrink_to_fit();
        assert_eq!(table.group_count(), groups_for(10));
        assert_eq!(table.len(), 10);
        for k in 0..10 {
            assert!(table.contains(&k));
        }
        assert_invariants(&table);
    }

    #[test]
    fn portable_table_agrees_with_default() {
        let mut rng = SmallRng::seed_from_u64(99);
        let mut fast: SipTable<u64> = HashTable::with_capacity(0);
        let mut portable: HashTable<u64, SipHashBuilder, crate::control::Portable> =
            HashTable::with_capacity(0);
        for _ in 0..5_000 {
            let key = rng.random_range(0..1_000u64);
            if rng.random_bool(0.7) {
                assert_eq!(fast.add(key), portable.add(key));
            } else {
                assert_eq!(fast.remove(&key), portable.remove(&key));
            }
        }
        assert_eq!(fast.len(), portable.len());
        for key in 0..1_000 {
            assert_eq!(fast.contains(&key), portable.contains(&key));
        }
    }

    #[test]
    fn debug_stats_reflect_counters() {
        let mut table: SipTable<u64> = HashTable::with_capacity(0);
        for k in 0..20 {
            table.add(k);
        }
        let stats = table.debug_stats();
        assert_eq!(stats.len, 20);
        assert_eq!(stats.group_count, table.group_count());
        assert_eq!(stats.total_slots, table.group_count() * GROUP_WIDTH);
        assert!(stats.load_factor > 0.0 && stats.load_factor <= 0.875);
        assert_eq!(table.probe_histogram().bins.iter().sum::<usize>(), 20);
    }
}
