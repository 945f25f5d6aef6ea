//! Entity capability interface and construction registry.
//!
//! Entity behavior lives outside this crate; chunks only need identity,
//! lifecycle, and persistence hooks. Concrete entity types are registered by
//! the world runtime against their saved type identifier.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use geode_nbt::NbtCompound;

/// Shared handle to an entity within the single-threaded tick domain.
pub type EntityRef = Rc<RefCell<dyn Entity>>;

/// Capability surface a chunk needs from any entity.
pub trait Entity {
    /// Runtime-unique entity id.
    fn id(&self) -> i64;

    /// Players are transient: they never dirty a chunk and never persist
    /// with it.
    fn is_player(&self) -> bool {
        false
    }

    fn is_closed(&self) -> bool;

    fn close(&mut self);

    /// Whether this entity should be written out with its chunk.
    fn can_save_with_chunk(&self) -> bool {
        true
    }

    /// Persisted form, including the `id` type identifier.
    fn save_nbt(&self) -> NbtCompound;
}

/// Builds one entity from its persisted compound. `None` means the record is
/// unusable and will be dropped by the caller.
pub type EntityConstructor = fn(runtime_id: i64, nbt: &NbtCompound) -> Option<EntityRef>;

/// Registry mapping saved type identifiers to constructors, plus the runtime
/// id allocator. Starts empty; the world runtime registers its entity set.
pub struct EntityFactory {
    constructors: HashMap<String, EntityConstructor>,
    next_id: Cell<i64>,
}

impl Default for EntityFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityFactory {
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
            next_id: Cell::new(1),
        }
    }

    pub fn register(&mut self, type_id: &str, constructor: EntityConstructor) {
        self.constructors.insert(type_id.to_string(), constructor);
    }

    pub fn allocate_id(&self) -> i64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }

    /// Construct an entity from a persisted compound. `None` for unknown type
    /// identifiers or constructor failure.
    pub fn create(&self, type_id: &str, nbt: &NbtCompound) -> Option<EntityRef> {
        let constructor = self.constructors.get(type_id)?;
        constructor(self.allocate_id(), nbt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geode_nbt::{CompoundExt, NbtTag};

    struct Slime {
        id: i64,
        size: i32,
        closed: bool,
    }

    impl Entity for Slime {
        fn id(&self) -> i64 {
            self.id
        }

        fn is_closed(&self) -> bool {
            self.closed
        }

        fn close(&mut self) {
            self.closed = true;
        }

        fn save_nbt(&self) -> NbtCompound {
            let mut c = NbtCompound::new();
            c.insert("id".into(), NbtTag::String("Slime".into()));
            c.insert("Size".into(), NbtTag::Int(self.size));
            c
        }
    }

    fn slime_from_nbt(runtime_id: i64, nbt: &NbtCompound) -> Option<EntityRef> {
        let size = nbt.get_int("Size")?;
        Some(Rc::new(RefCell::new(Slime {
            id: runtime_id,
            size,
            closed: false,
        })))
    }

    #[test]
    fn create_known_type() {
        let mut factory = EntityFactory::new();
        factory.register("Slime", slime_from_nbt);

        let mut nbt = NbtCompound::new();
        nbt.insert("Size".into(), NbtTag::Int(2));
        let entity = factory.create("Slime", &nbt).unwrap();
        assert!(!entity.borrow().is_closed());
        assert_eq!(entity.borrow().save_nbt().get_int("Size"), Some(2));
    }

    #[test]
    fn unknown_type_is_none() {
        let factory = EntityFactory::new();
        assert!(factory.create("Zombie", &NbtCompound::new()).is_none());
    }

    #[test]
    fn constructor_failure_is_none() {
        let mut factory = EntityFactory::new();
        factory.register("Slime", slime_from_nbt);
        // missing Size tag
        assert!(factory.create("Slime", &NbtCompound::new()).is_none());
    }

    #[test]
    fn ids_are_unique() {
        let mut factory = EntityFactory::new();
        factory.register("Slime", slime_from_nbt);
        let mut nbt = NbtCompound::new();
        nbt.insert("Size".into(), NbtTag::Int(1));
        let a = factory.create("Slime", &nbt).unwrap();
        let b = factory.create("Slime", &nbt).unwrap();
        assert_ne!(a.borrow().id(), b.borrow().id());
    }
}
