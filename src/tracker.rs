use std::{
  collections::{BTreeMap, BTreeSet, HashMap},
  sync::Arc,
};

use log::{debug, warn};
use serde::Serialize;

use crate::event::{Event, EventRecord};
use crate::range_index::RangeIndex;
use crate::reader::InternTable;
use crate::wire::{Address, LabelId};

/// Class name used when an Alloc carries no class label.
pub const UNCLASSIFIED: &str = "<unclassified>";

/// Recognized prefix of a report directive carried by a null-address
/// Label event.
pub const DIRECTIVE_PREFIX: &str = "dump ";

/// Accounting maintained at every scope: global, arena, pool and class.
///
/// `current_*` always equals the sum of the scope's children; `peak_*` and
/// `lifetime_*` are monotonic watermarks and are never decremented.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScopeStats {
  pub current_count: u64,
  pub current_reserved: u64,
  pub current_size: u64,
  pub lifetime_count: u64,
  pub lifetime_reserved: u64,
  pub lifetime_size: u64,
  pub peak_count: u64,
  pub peak_reserved: u64,
  pub peak_size: u64,
}

impl ScopeStats {
  fn bump_peaks(&mut self) {
    self.peak_count = self.peak_count.max(self.current_count);
    self.peak_reserved = self.peak_reserved.max(self.current_reserved);
    self.peak_size = self.peak_size.max(self.current_size);
  }

  fn on_alloc(&mut self, size: u64) {
    self.current_count = self.current_count.saturating_add(1);
    self.current_size = self.current_size.saturating_add(size);
    self.lifetime_count = self.lifetime_count.saturating_add(1);
    self.lifetime_size = self.lifetime_size.saturating_add(size);
    self.bump_peaks();
  }

  fn on_free(&mut self, bytes: u64, removed: bool) {
    self.current_size = self.current_size.saturating_sub(bytes);
    if removed {
      self.current_count = self.current_count.saturating_sub(1);
    }
  }

  fn on_release(&mut self, size: u64) {
    self.current_reserved = self.current_reserved.saturating_sub(size);
  }

  fn on_reserve(&mut self, size: u64) {
    self.current_reserved = self.current_reserved.saturating_add(size);
    self.lifetime_reserved = self.lifetime_reserved.saturating_add(size);
    self.bump_peaks();
  }

  /// Fold a retired child's residual current values out of this scope.
  fn retire_child(&mut self, child: &ScopeStats) {
    self.current_count = self.current_count.saturating_sub(child.current_count);
    self.current_reserved = self
      .current_reserved
      .saturating_sub(child.current_reserved);
    self.current_size = self.current_size.saturating_sub(child.current_size);
  }
}

/// One live pool inside exactly one arena. Owns the address-range index
/// resolving frees back to their allocation class.
#[derive(Debug)]
pub struct PoolRecord {
  pub address: Address,
  pub arena: Address,
  /// The pool's own class label from its PoolInit event, if any.
  pub class_label: Option<Arc<str>>,
  pub classes: HashMap<Arc<str>, ScopeStats>,
  pub index: RangeIndex,
  pub name: Option<Arc<str>>,
  pub stats: ScopeStats,
}

/// One live arena instance: root of one accounting subtree.
#[derive(Debug)]
pub struct ArenaRecord {
  pub address: Address,
  /// Per-class aggregation across this arena's pools.
  pub classes: HashMap<Arc<str>, ScopeStats>,
  pub grain: u64,
  pub name: Option<Arc<str>>,
  pub pools: BTreeSet<Address>,
  pub stats: ScopeStats,
}

/// A destroyed arena with its force-retired pools, for destructor-time
/// reports.
#[derive(Debug)]
pub struct RetiredArena {
  pub arena: ArenaRecord,
  pub pools: Vec<PoolRecord>,
}

/// What applying one record did, for the driver's line-by-line output.
#[derive(Debug)]
pub enum Applied {
  Allocated {
    address: Address,
    arena: Address,
    class: Arc<str>,
    pool: Address,
    size: u64,
  },
  ArenaCreated {
    arena: Address,
  },
  ArenaDestroyed(Box<RetiredArena>),
  Committed {
    arena: Address,
    committed: u64,
  },
  /// A null-address Label carried a `dump` directive; the payload is the
  /// selector expression after the prefix.
  Directive(Arc<str>),
  Freed {
    address: Address,
    arena: Address,
    freed: u64,
    pool: Address,
    unmatched: u64,
  },
  PoolFinished(Box<PoolRecord>),
  PoolInitialized {
    arena: Address,
    pool: Address,
  },
  Released {
    arena: Address,
    pool: Address,
    size: u64,
  },
  Reserved {
    arena: Address,
    pool: Address,
    size: u64,
  },
  /// The event referenced an untracked entity, carried no accounting
  /// meaning, or was informational only.
  Skipped,
}

/// Hierarchical accounting model reconstructed from one event stream.
///
/// Constructed once per decode session and owned exclusively by it.
/// Records must be applied in log order: later events depend on the
/// range-index state built by earlier ones.
#[derive(Debug, Default)]
pub struct Tracker {
  arenas: BTreeMap<Address, ArenaRecord>,
  /// Per-class aggregation across the whole process.
  classes: HashMap<Arc<str>, ScopeStats>,
  global: ScopeStats,
  inconsistencies: u64,
  pools: BTreeMap<Address, PoolRecord>,
}

impl Tracker {
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  /// Apply one decoded record to the accounting model.
  ///
  /// Events referencing untracked entities are skipped, never fatal: the
  /// log may have started after the entity was created.
  pub fn apply(
    &mut self,
    record: &EventRecord,
    strings: &InternTable,
  ) -> Applied {
    match &record.event {
      Event::Intern { .. } | Event::Unknown { .. } | Event::Meter { .. } => {
        Applied::Skipped
      }
      Event::Label { address, id } => self.apply_label(*address, *id, strings),
      Event::ArenaCreate { arena, grain } => {
        self.apply_arena_create(*arena, *grain)
      }
      Event::ArenaDestroy { arena } => self.apply_arena_destroy(*arena),
      Event::PoolInit {
        pool,
        arena,
        class_id,
      } => self.apply_pool_init(*pool, *arena, *class_id, strings),
      Event::PoolFinish { pool } => self.apply_pool_finish(*pool),
      Event::Reserve { arena, pool, size } => {
        self.apply_reserve(*arena, *pool, *size)
      }
      Event::Release { arena, pool, size } => {
        self.apply_release(*arena, *pool, *size)
      }
      Event::Alloc {
        pool,
        address,
        size,
        class_id,
        location_id: _,
      } => self.apply_alloc(*pool, *address, *size, *class_id, strings),
      Event::Free {
        pool,
        address,
        size,
      } => self.apply_free(*pool, *address, *size),
      Event::Commit { arena, committed } => {
        if self.arenas.contains_key(arena) {
          Applied::Committed {
            arena: *arena,
            committed: *committed,
          }
        } else {
          Applied::Skipped
        }
      }
    }
  }

  #[must_use]
  pub fn arenas(&self) -> &BTreeMap<Address, ArenaRecord> {
    &self.arenas
  }

  #[must_use]
  pub fn classes(&self) -> &HashMap<Arc<str>, ScopeStats> {
    &self.classes
  }

  #[must_use]
  pub fn global(&self) -> &ScopeStats {
    &self.global
  }

  /// Count of best-effort accounting violations seen so far: unmatched
  /// frees, frees spanning gaps, duplicated creations.
  #[must_use]
  pub fn inconsistencies(&self) -> u64 {
    self.inconsistencies
  }

  #[must_use]
  pub fn pools(&self) -> &BTreeMap<Address, PoolRecord> {
    &self.pools
  }

  /// Immutable, deterministically ordered view of the current accounting
  /// tree: arenas by address, pools by address, classes by name.
  #[must_use]
  pub fn snapshot(&self) -> Snapshot {
    let arenas = self
      .arenas
      .values()
      .map(|arena| ArenaSnapshot {
        address: arena.address,
        classes: sorted_classes(&arena.classes),
        name: arena.name.as_deref().map(str::to_owned),
        pools: arena
          .pools
          .iter()
          .filter_map(|pool_addr| self.pools.get(pool_addr))
          .map(|pool| PoolSnapshot {
            address: pool.address,
            classes: sorted_classes(&pool.classes),
            name: pool.name.as_deref().map(str::to_owned),
            stats: pool.stats,
          })
          .collect(),
        stats: arena.stats,
      })
      .collect();

    Snapshot {
      arenas,
      classes: sorted_classes(&self.classes),
      global: self.global,
      inconsistencies: self.inconsistencies,
    }
  }

  fn apply_alloc(
    &mut self,
    pool_addr: Address,
    address: Address,
    size: u64,
    class_id: LabelId,
    strings: &InternTable,
  ) -> Applied {
    let class = resolve_class(class_id, strings);

    let Some(pool) = self.pools.get_mut(&pool_addr) else {
      debug!("alloc in untracked pool {pool_addr:#x}, skipped");
      return Applied::Skipped;
    };
    let arena_addr = pool.arena;

    // A well-formed log never overlaps live allocations; fold any evicted
    // bytes out first so the index invariant holds.
    let evicted = pool.index.insert(address, size, class.clone());
    for slice in &evicted.slices {
      pool
        .classes
        .entry(slice.class.clone())
        .or_default()
        .on_free(slice.bytes, slice.removed);
      pool.stats.on_free(slice.bytes, slice.removed);
    }

    pool
      .classes
      .entry(class.clone())
      .or_default()
      .on_alloc(size);
    pool.stats.on_alloc(size);

    if !evicted.slices.is_empty() {
      warn!(
        "overlapping allocation at {address:#x}+{size} in pool \
         {pool_addr:#x}; evicted {} live bytes",
        evicted.freed_bytes()
      );
      self.inconsistencies += 1;
      for slice in &evicted.slices {
        self.debit_class(arena_addr, &slice.class, slice.bytes, slice.removed);
      }
    }

    self.credit_class(arena_addr, &class, size);

    Applied::Allocated {
      address,
      arena: arena_addr,
      class,
      pool: pool_addr,
      size,
    }
  }

  fn apply_arena_create(&mut self, address: Address, grain: u64) -> Applied {
    if self.arenas.contains_key(&address) {
      warn!("arena {address:#x} created twice; resetting its accounting");
      self.inconsistencies += 1;
      self.retire_arena(address);
    }

    self.arenas.insert(
      address,
      ArenaRecord {
        address,
        classes: HashMap::new(),
        grain,
        name: None,
        pools: BTreeSet::new(),
        stats: ScopeStats::default(),
      },
    );

    Applied::ArenaCreated { arena: address }
  }

  fn apply_arena_destroy(&mut self, address: Address) -> Applied {
    match self.retire_arena(address) {
      Some(retired) => Applied::ArenaDestroyed(Box::new(retired)),
      None => {
        debug!("destroy of untracked arena {address:#x}, skipped");
        Applied::Skipped
      }
    }
  }

  fn apply_free(
    &mut self,
    pool_addr: Address,
    address: Address,
    size: u64,
  ) -> Applied {
    let Some(pool) = self.pools.get_mut(&pool_addr) else {
      debug!("free in untracked pool {pool_addr:#x}, skipped");
      return Applied::Skipped;
    };
    let arena_addr = pool.arena;

    let outcome = pool.index.free(address, size);

    for slice in &outcome.slices {
      pool
        .classes
        .entry(slice.class.clone())
        .or_default()
        .on_free(slice.bytes, slice.removed);
      pool.stats.on_free(slice.bytes, slice.removed);
    }

    for slice in &outcome.slices {
      self.debit_class(arena_addr, &slice.class, slice.bytes, slice.removed);
    }

    if outcome.unmatched > 0 {
      warn!(
        "free of {address:#x}+{size} in pool {pool_addr:#x} has {} bytes \
         with no live range",
        outcome.unmatched
      );
      self.inconsistencies += 1;
    }

    Applied::Freed {
      address,
      arena: arena_addr,
      freed: outcome.freed_bytes(),
      pool: pool_addr,
      unmatched: outcome.unmatched,
    }
  }

  fn apply_label(
    &mut self,
    address: Address,
    id: LabelId,
    strings: &InternTable,
  ) -> Applied {
    let Some(text) = strings.get(id) else {
      debug!("label references unknown string id {id}, skipped");
      return Applied::Skipped;
    };

    if address == 0 {
      return match text.strip_prefix(DIRECTIVE_PREFIX) {
        Some(selector) => Applied::Directive(Arc::from(selector)),
        None => {
          debug!("ignoring unrecognized directive {text:?}");
          Applied::Skipped
        }
      };
    }

    if let Some(arena) = self.arenas.get_mut(&address) {
      arena.name = Some(text);
    } else if let Some(pool) = self.pools.get_mut(&address) {
      pool.name = Some(text);
    } else {
      debug!("label for untracked address {address:#x}, skipped");
    }

    Applied::Skipped
  }

  fn apply_pool_finish(&mut self, address: Address) -> Applied {
    match self.retire_pool(address) {
      Some(pool) => Applied::PoolFinished(Box::new(pool)),
      None => {
        debug!("finish of untracked pool {address:#x}, skipped");
        Applied::Skipped
      }
    }
  }

  fn apply_pool_init(
    &mut self,
    pool: Address,
    arena_addr: Address,
    class_id: LabelId,
    strings: &InternTable,
  ) -> Applied {
    if !self.arenas.contains_key(&arena_addr) {
      debug!("pool init in untracked arena {arena_addr:#x}, skipped");
      return Applied::Skipped;
    }

    if self.pools.contains_key(&pool) {
      warn!("pool {pool:#x} initialized twice; resetting its accounting");
      self.inconsistencies += 1;
      self.retire_pool(pool);
    }

    let class_label = (class_id != 0).then(|| resolve_class(class_id, strings));

    self.pools.insert(
      pool,
      PoolRecord {
        address: pool,
        arena: arena_addr,
        class_label,
        classes: HashMap::new(),
        index: RangeIndex::new(),
        name: None,
        stats: ScopeStats::default(),
      },
    );

    if let Some(arena) = self.arenas.get_mut(&arena_addr) {
      arena.pools.insert(pool);
    }

    Applied::PoolInitialized {
      arena: arena_addr,
      pool,
    }
  }

  fn apply_release(
    &mut self,
    arena_addr: Address,
    pool_addr: Address,
    size: u64,
  ) -> Applied {
    let Some(arena) = self.arenas.get_mut(&arena_addr) else {
      debug!("release in untracked arena {arena_addr:#x}, skipped");
      return Applied::Skipped;
    };

    arena.stats.on_release(size);
    if let Some(pool) = self.pools.get_mut(&pool_addr) {
      pool.stats.on_release(size);
    }
    self.global.on_release(size);

    Applied::Released {
      arena: arena_addr,
      pool: pool_addr,
      size,
    }
  }

  fn apply_reserve(
    &mut self,
    arena_addr: Address,
    pool_addr: Address,
    size: u64,
  ) -> Applied {
    let Some(arena) = self.arenas.get_mut(&arena_addr) else {
      debug!("reserve in untracked arena {arena_addr:#x}, skipped");
      return Applied::Skipped;
    };

    arena.stats.on_reserve(size);
    if let Some(pool) = self.pools.get_mut(&pool_addr) {
      pool.stats.on_reserve(size);
    }
    self.global.on_reserve(size);

    Applied::Reserved {
      arena: arena_addr,
      pool: pool_addr,
      size,
    }
  }

  /// Grow the named class at arena and global scope.
  fn credit_class(&mut self, arena_addr: Address, class: &Arc<str>, size: u64) {
    if let Some(arena) = self.arenas.get_mut(&arena_addr) {
      arena.classes.entry(class.clone()).or_default().on_alloc(size);
      arena.stats.on_alloc(size);
    }

    self.classes.entry(class.clone()).or_default().on_alloc(size);
    self.global.on_alloc(size);
  }

  /// Shrink the named class at arena and global scope.
  fn debit_class(
    &mut self,
    arena_addr: Address,
    class: &Arc<str>,
    bytes: u64,
    removed: bool,
  ) {
    if let Some(arena) = self.arenas.get_mut(&arena_addr) {
      arena
        .classes
        .entry(class.clone())
        .or_default()
        .on_free(bytes, removed);
      arena.stats.on_free(bytes, removed);
    }

    self
      .classes
      .entry(class.clone())
      .or_default()
      .on_free(bytes, removed);
    self.global.on_free(bytes, removed);
  }

  /// Force-retire every pool under the arena, then fold the arena's
  /// residual totals out of the global aggregate and drop the record.
  fn retire_arena(&mut self, address: Address) -> Option<RetiredArena> {
    let pool_addrs: Vec<Address> =
      self.arenas.get(&address)?.pools.iter().copied().collect();

    let mut pools = Vec::new();
    for pool_addr in pool_addrs {
      if let Some(pool) = self.retire_pool(pool_addr) {
        pools.push(pool);
      }
    }

    let arena = self.arenas.remove(&address)?;
    self.global.retire_child(&arena.stats);

    Some(RetiredArena { arena, pools })
  }

  /// Implicitly free every still-live range, then fold the pool's
  /// residual totals out of its ancestors and drop the record.
  fn retire_pool(&mut self, pool_addr: Address) -> Option<PoolRecord> {
    let mut pool = self.pools.remove(&pool_addr)?;
    let arena_addr = pool.arena;

    for (_, size, class) in pool.index.drain() {
      pool
        .classes
        .entry(class.clone())
        .or_default()
        .on_free(size, true);
      pool.stats.on_free(size, true);
      self.debit_class(arena_addr, &class, size, true);
    }

    // Anything left, such as unreleased reservations, leaves with the
    // pool.
    if let Some(arena) = self.arenas.get_mut(&arena_addr) {
      arena.pools.remove(&pool_addr);
      arena.stats.retire_child(&pool.stats);
    }
    self.global.retire_child(&pool.stats);

    Some(pool)
  }
}

fn resolve_class(class_id: LabelId, strings: &InternTable) -> Arc<str> {
  if class_id == 0 {
    return Arc::from(UNCLASSIFIED);
  }

  strings
    .get(class_id)
    .unwrap_or_else(|| Arc::from(format!("label#{class_id}")))
}

fn sorted_classes(
  classes: &HashMap<Arc<str>, ScopeStats>,
) -> Vec<ClassSnapshot> {
  let mut out: Vec<ClassSnapshot> = classes
    .iter()
    .map(|(name, stats)| ClassSnapshot {
      name: name.to_string(),
      stats: *stats,
    })
    .collect();

  out.sort_by(|a, b| a.name.cmp(&b.name));
  out
}

/// Immutable accounting tree: arenas in address order, pools in address
/// order, classes in name order.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
  pub arenas: Vec<ArenaSnapshot>,
  pub classes: Vec<ClassSnapshot>,
  pub global: ScopeStats,
  pub inconsistencies: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArenaSnapshot {
  pub address: Address,
  pub classes: Vec<ClassSnapshot>,
  pub name: Option<String>,
  pub pools: Vec<PoolSnapshot>,
  pub stats: ScopeStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
  pub address: Address,
  pub classes: Vec<ClassSnapshot>,
  pub name: Option<String>,
  pub stats: ScopeStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassSnapshot {
  pub name: String,
  pub stats: ScopeStats,
}
