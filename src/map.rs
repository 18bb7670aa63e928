use std::fmt;
use std::num::NonZeroU128;
use std::ops::Deref;

use crate::ebr::{self, Guard};
use crate::raw;

/// A 128-bit hash identifying a key.
///
/// The table does no hashing of its own: the caller supplies a hash value
/// per call, and the hash alone stands in for key identity. Callers should
/// derive it from a hash function whose 128-bit output can be treated as
/// collision-free for their key space.
///
/// Zero is reserved to mark empty buckets, which is why construction goes
/// through [`NonZeroU128`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct HashValue(NonZeroU128);

impl HashValue {
    /// Creates a hash value, returning `None` for the reserved value zero.
    #[inline]
    pub fn new(hash: u128) -> Option<HashValue> {
        NonZeroU128::new(hash).map(HashValue)
    }

    /// Returns the hash as an integer.
    #[inline]
    pub fn get(self) -> u128 {
        self.0.get()
    }
}

impl From<NonZeroU128> for HashValue {
    #[inline]
    fn from(hash: NonZeroU128) -> HashValue {
        HashValue(hash)
    }
}

/// A wait-free, linearizable hash table with insertion-ordered snapshots.
///
/// The table maps caller-supplied [128-bit hashes](HashValue) to values.
/// Every committed write is stamped with a unique, totally ordered *epoch*
/// by the [epoch manager](crate::ebr), which is what makes reads
/// linearizable and lets [`view`](Table::view) produce a fully consistent
/// snapshot sorted by each entry's first insertion.
///
/// Most operations require a [`Guard`], acquired through [`Table::guard`].
/// References returned by table operations are tied to the guard and the
/// table borrow, and remain valid until the guard is dropped — even if the
/// entry is concurrently overwritten or removed.
///
/// # Examples
///
/// ```
/// use strata::{HashValue, Table};
///
/// let table = Table::new();
/// let guard = table.guard();
///
/// let key = HashValue::new(0xfeed_beef).unwrap();
/// assert_eq!(table.insert(key, 31, &guard), None);
/// assert_eq!(table.get(key, &guard), Some(&31));
/// assert_eq!(table.remove(key, &guard), Some(&31));
/// assert_eq!(table.get(key, &guard), None);
/// ```
pub struct Table<V> {
    raw: raw::Table<V>,
}

impl<V> Table<V> {
    /// Creates an empty table with the default initial capacity.
    ///
    /// # Examples
    ///
    /// ```
    /// use strata::Table;
    /// let table: Table<i32> = Table::new();
    /// ```
    pub fn new() -> Table<V> {
        Table::with_capacity(0)
    }

    /// Creates an empty table that holds at least `capacity` entries
    /// before migrating to a larger store.
    ///
    /// The capacity is rounded up to leave the occupancy headroom the
    /// migration threshold requires. The table never shrinks below it.
    ///
    /// # Examples
    ///
    /// ```
    /// use strata::Table;
    /// let table: Table<i32> = Table::with_capacity(1024);
    /// ```
    pub fn with_capacity(capacity: usize) -> Table<V> {
        Table {
            raw: raw::Table::with_capacity(capacity),
        }
    }

    /// Pins the current thread, returning a guard for table operations.
    ///
    /// The guard's reservation is validated against the global epoch, so
    /// every operation performed with it is linearizable and every
    /// reference it hands out stays valid for the guard's lifetime.
    pub fn guard(&self) -> Guard {
        ebr::pin_linearized()
    }
}

impl<V> Table<V>
where
    V: Send + Sync,
{
    /// Returns a reference to the value for `hash`, if present.
    ///
    /// The read linearizes at the current epoch: it sees exactly the last
    /// write committed at or before it, helping any in-flight write commit
    /// first.
    #[inline]
    pub fn get<'g>(&'g self, hash: HashValue, guard: &'g Guard) -> Option<&'g V> {
        self.raw.get(hash, guard)
    }

    /// Inserts a value for `hash`, returning the value it displaced, if
    /// any.
    ///
    /// When two writers collide on the same bucket, the loser does not
    /// retry: it linearizes immediately before the winner in the same
    /// epoch, its value is dropped unobserved, and both report the value
    /// displaced by the collision. This is what makes the operation
    /// wait-free.
    ///
    /// # Examples
    ///
    /// ```
    /// use strata::{HashValue, Table};
    ///
    /// let table = Table::new();
    /// let guard = table.guard();
    /// let key = HashValue::new(7).unwrap();
    ///
    /// assert_eq!(table.insert(key, "a", &guard), None);
    /// assert_eq!(table.insert(key, "b", &guard), Some(&"a"));
    /// ```
    #[inline]
    pub fn insert<'g>(&'g self, hash: HashValue, value: V, guard: &'g Guard) -> Option<&'g V> {
        self.raw.insert(hash, value, guard)
    }

    /// Inserts a value for `hash` only if the key is absent.
    ///
    /// On failure the value is handed back, together with a reference to
    /// the current value.
    ///
    /// # Examples
    ///
    /// ```
    /// use strata::{HashValue, Table};
    ///
    /// let table = Table::new();
    /// let guard = table.guard();
    /// let key = HashValue::new(7).unwrap();
    ///
    /// assert!(table.try_insert(key, 1, &guard).is_ok());
    ///
    /// let err = table.try_insert(key, 2, &guard).unwrap_err();
    /// assert_eq!(err.current, &1);
    /// assert_eq!(err.not_inserted, 2);
    /// ```
    pub fn try_insert<'g>(
        &'g self,
        hash: HashValue,
        value: V,
        guard: &'g Guard,
    ) -> Result<(), OccupiedError<'g, V>> {
        self.raw
            .try_insert(hash, value, guard)
            .map_err(|(current, not_inserted)| OccupiedError {
                current,
                not_inserted,
            })
    }

    /// Replaces the value for `hash` only if the key is present, returning
    /// the displaced value.
    ///
    /// If the key is absent the value is handed back unchanged.
    #[inline]
    pub fn replace<'g>(&'g self, hash: HashValue, value: V, guard: &'g Guard) -> Result<&'g V, V> {
        self.raw.replace(hash, value, guard)
    }

    /// Removes the value for `hash`, returning it if the key was present.
    #[inline]
    pub fn remove<'g>(&'g self, hash: HashValue, guard: &'g Guard) -> Option<&'g V> {
        self.raw.remove(hash, guard)
    }

    /// Returns the number of entries in the table.
    ///
    /// The count is approximate: it trails operations that are still in
    /// flight. For an exact count at a single epoch, use the length of a
    /// [`view`](Table::view).
    #[inline]
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    /// Returns `true` if the table holds no entries. Approximate, like
    /// [`len`](Table::len).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Takes a consistent snapshot of the table, ordered by insertion.
    ///
    /// The view linearizes at a single epoch: an entry appears exactly when
    /// a write committed at or before that epoch made it present and no
    /// removal committed at or before it made it absent. Entries are sorted
    /// by the epoch of the insertion that first made the key present (since
    /// its most recent removal, if any) — overwriting a value does not move
    /// an entry, removing and re-inserting it does.
    ///
    /// # Examples
    ///
    /// ```
    /// use strata::{HashValue, Table};
    ///
    /// let table = Table::new();
    /// let guard = table.guard();
    ///
    /// for (i, value) in ["a", "b", "c"].iter().enumerate() {
    ///     table.insert(HashValue::new(i as u128 + 1).unwrap(), *value, &guard);
    /// }
    ///
    /// let values: Vec<_> = table.view(&guard).iter().map(|e| *e.value()).collect();
    /// assert_eq!(values, ["a", "b", "c"]);
    /// ```
    pub fn view<'g>(&'g self, guard: &'g Guard) -> View<'g, V> {
        View {
            entries: self
                .raw
                .view(guard)
                .into_iter()
                .map(|(epoch, value)| ViewEntry { value, epoch })
                .collect(),
        }
    }
}

impl<V> Default for Table<V> {
    fn default() -> Table<V> {
        Table::new()
    }
}

impl<V> fmt::Debug for Table<V>
where
    V: fmt::Debug + Send + Sync,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.guard();
        f.debug_list().entries(self.view(&guard).iter()).finish()
    }
}

/// A consistent, insertion-ordered snapshot of a [`Table`].
///
/// Dereferences to a slice of [`ViewEntry`], sorted ascending by insertion
/// epoch. See [`Table::view`] for the snapshot semantics.
pub struct View<'g, V> {
    entries: Vec<ViewEntry<'g, V>>,
}

impl<'g, V> Deref for View<'g, V> {
    type Target = [ViewEntry<'g, V>];

    fn deref(&self) -> &Self::Target {
        &self.entries
    }
}

impl<'g, V> IntoIterator for View<'g, V> {
    type Item = ViewEntry<'g, V>;
    type IntoIter = std::vec::IntoIter<ViewEntry<'g, V>>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<'a, 'g, V> IntoIterator for &'a View<'g, V> {
    type Item = &'a ViewEntry<'g, V>;
    type IntoIter = std::slice::Iter<'a, ViewEntry<'g, V>>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

impl<V: fmt::Debug> fmt::Debug for View<'_, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.entries.iter()).finish()
    }
}

/// One entry of a [`View`].
pub struct ViewEntry<'g, V> {
    value: &'g V,
    epoch: u64,
}

impl<'g, V> ViewEntry<'g, V> {
    /// The entry's value at the view's epoch.
    #[inline]
    pub fn value(&self) -> &'g V {
        self.value
    }

    /// The epoch of the insertion that first made this entry present.
    #[inline]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl<V: fmt::Debug> fmt::Debug for ViewEntry<'_, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewEntry")
            .field("value", &self.value)
            .field("epoch", &self.epoch)
            .finish()
    }
}

/// The error returned by [`Table::try_insert`] when the key is already
/// present.
pub struct OccupiedError<'g, V> {
    /// The value currently mapped to the hash.
    pub current: &'g V,
    /// The value that was not inserted.
    pub not_inserted: V,
}

impl<V: fmt::Debug> fmt::Debug for OccupiedError<'_, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OccupiedError")
            .field("current", &self.current)
            .field("not_inserted", &self.not_inserted)
            .finish()
    }
}
