//! Tiles (block entities): capability interface, construction registry, and
//! the built-in Sign and Chest data models.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use geode_nbt::{CompoundExt, NbtCompound, NbtTag};

/// Shared handle to a tile within the single-threaded tick domain.
pub type TileRef = Rc<RefCell<dyn Tile>>;

/// Capability surface a chunk needs from any tile.
pub trait Tile {
    /// Runtime-unique tile id.
    fn id(&self) -> u64;

    /// World-space block position.
    fn position(&self) -> (i32, i32, i32);

    fn is_closed(&self) -> bool;

    fn close(&mut self);

    /// Persisted form, including the `id` type identifier and position.
    fn save_nbt(&self) -> NbtCompound;

    /// Compound sent to clients inside chunk packets. `None` for tiles with
    /// no client-visible state.
    fn spawn_compound(&self) -> Option<NbtCompound> {
        None
    }
}

/// Builds one tile from its persisted compound. `None` means the record is
/// unusable and will be dropped by the caller.
pub type TileConstructor = fn(runtime_id: u64, nbt: &NbtCompound) -> Option<TileRef>;

/// Registry mapping saved type identifiers to constructors, plus the runtime
/// id allocator.
pub struct TileFactory {
    constructors: HashMap<String, TileConstructor>,
    next_id: Cell<u64>,
}

impl Default for TileFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl TileFactory {
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
            next_id: Cell::new(1),
        }
    }

    /// Registry pre-loaded with the built-in tile types.
    pub fn with_defaults() -> Self {
        let mut factory = Self::new();
        factory.register(Sign::TYPE_ID, Sign::from_nbt);
        factory.register(Chest::TYPE_ID, Chest::from_nbt);
        factory
    }

    pub fn register(&mut self, type_id: &str, constructor: TileConstructor) {
        self.constructors.insert(type_id.to_string(), constructor);
    }

    pub fn allocate_id(&self) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }

    /// Construct a tile from a persisted compound. `None` for unknown type
    /// identifiers or constructor failure.
    pub fn create(&self, type_id: &str, nbt: &NbtCompound) -> Option<TileRef> {
        let constructor = self.constructors.get(type_id)?;
        constructor(self.allocate_id(), nbt)
    }
}

fn position_from_nbt(nbt: &NbtCompound) -> Option<(i32, i32, i32)> {
    Some((nbt.get_int("x")?, nbt.get_int("y")?, nbt.get_int("z")?))
}

fn put_position(c: &mut NbtCompound, (x, y, z): (i32, i32, i32)) {
    c.insert("x".into(), NbtTag::Int(x));
    c.insert("y".into(), NbtTag::Int(y));
    c.insert("z".into(), NbtTag::Int(z));
}

// ---------------------------------------------------------------------------
// Sign
// ---------------------------------------------------------------------------

/// A sign with front and back text faces.
pub struct Sign {
    id: u64,
    position: (i32, i32, i32),
    pub front_text: String,
    pub back_text: String,
    closed: bool,
}

impl Sign {
    pub const TYPE_ID: &'static str = "Sign";

    pub fn new(id: u64, position: (i32, i32, i32)) -> Self {
        Self {
            id,
            position,
            front_text: String::new(),
            back_text: String::new(),
            closed: false,
        }
    }

    pub fn from_nbt(runtime_id: u64, nbt: &NbtCompound) -> Option<TileRef> {
        let position = position_from_nbt(nbt)?;
        let face_text = |face: &str| {
            nbt.get_compound(face)
                .and_then(|c| c.get_string("Text"))
                .unwrap_or_default()
                .to_string()
        };
        Some(Rc::new(RefCell::new(Sign {
            id: runtime_id,
            position,
            front_text: face_text("FrontText"),
            back_text: face_text("BackText"),
            closed: false,
        })))
    }

    fn build_nbt(&self) -> NbtCompound {
        let mut c = NbtCompound::new();
        c.insert("id".into(), NbtTag::String(Self::TYPE_ID.into()));
        put_position(&mut c, self.position);

        let mut front = NbtCompound::new();
        front.insert("Text".into(), NbtTag::String(self.front_text.clone()));
        c.insert("FrontText".into(), NbtTag::Compound(front));

        let mut back = NbtCompound::new();
        back.insert("Text".into(), NbtTag::String(self.back_text.clone()));
        c.insert("BackText".into(), NbtTag::Compound(back));

        c
    }
}

impl Tile for Sign {
    fn id(&self) -> u64 {
        self.id
    }

    fn position(&self) -> (i32, i32, i32) {
        self.position
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn close(&mut self) {
        self.closed = true;
    }

    fn save_nbt(&self) -> NbtCompound {
        self.build_nbt()
    }

    fn spawn_compound(&self) -> Option<NbtCompound> {
        Some(self.build_nbt())
    }
}

// ---------------------------------------------------------------------------
// Chest
// ---------------------------------------------------------------------------

/// A chest holding its item list as raw slot compounds.
pub struct Chest {
    id: u64,
    position: (i32, i32, i32),
    pub items: Vec<NbtTag>,
    closed: bool,
}

impl Chest {
    pub const TYPE_ID: &'static str = "Chest";

    pub fn new(id: u64, position: (i32, i32, i32)) -> Self {
        Self {
            id,
            position,
            items: Vec::new(),
            closed: false,
        }
    }

    pub fn from_nbt(runtime_id: u64, nbt: &NbtCompound) -> Option<TileRef> {
        let position = position_from_nbt(nbt)?;
        let items = nbt.get_list("Items").map(<[NbtTag]>::to_vec).unwrap_or_default();
        Some(Rc::new(RefCell::new(Chest {
            id: runtime_id,
            position,
            items,
            closed: false,
        })))
    }

    fn build_nbt(&self) -> NbtCompound {
        let mut c = NbtCompound::new();
        c.insert("id".into(), NbtTag::String(Self::TYPE_ID.into()));
        put_position(&mut c, self.position);
        c.insert("Items".into(), NbtTag::List(self.items.clone()));
        c
    }
}

impl Tile for Chest {
    fn id(&self) -> u64 {
        self.id
    }

    fn position(&self) -> (i32, i32, i32) {
        self.position
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn close(&mut self) {
        self.closed = true;
    }

    fn save_nbt(&self) -> NbtCompound {
        self.build_nbt()
    }

    fn spawn_compound(&self) -> Option<NbtCompound> {
        Some(self.build_nbt())
    }
}
