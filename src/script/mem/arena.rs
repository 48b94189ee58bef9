use std::fmt::{self, Debug, Formatter};

use crate::script::mem::schema::{read_field_bits, StructDefinition, StructFlags};
use crate::script::mem::BaseTag;

/// Index of an arena slot. Handles are plain data so they can live inside
/// stack cells and packed field bytes; the arena validates them on use.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct ObjectHandle(u32);

impl ObjectHandle {
    pub fn to_bits(self) -> u64 {
        self.0 as u64
    }

    pub fn from_bits(bits: u64) -> ObjectHandle {
        ObjectHandle(bits as u32)
    }
}

impl Debug for ObjectHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "obj#{}", self.0)
    }
}

/// A heap-allocated aggregate: same data layout as an inline instance, but
/// the field bytes live in the arena instead of stack cells.
pub struct InstanceObject {
    pub definition: ObjectHandle,
    pub data: Vec<u8>,
}

pub enum ArenaObject {
    Definition(StructDefinition),
    Instance(InstanceObject),
}

struct ArenaSlot {
    refs: u32,
    object: ArenaObject,
}

/// Reference-counted object storage. `create` starts the count at zero; the
/// first retain brings it to one, so a transient allocation nobody adopts
/// can be torn down by a single release.
#[derive(Default)]
pub struct ObjectArena {
    slots: Vec<Option<ArenaSlot>>,
    free: Vec<u32>,
}

impl ObjectArena {
    pub fn new() -> Self {
        ObjectArena::default()
    }

    pub fn create(&mut self, object: ArenaObject) -> ObjectHandle {
        let slot = ArenaSlot { refs: 0, object };

        match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(slot);
                ObjectHandle(index)
            }
            None => {
                self.slots.push(Some(slot));
                ObjectHandle(self.slots.len() as u32 - 1)
            }
        }
    }

    pub fn retain(&mut self, handle: ObjectHandle) {
        match self.slot_mut(handle) {
            Some(slot) => slot.refs += 1,
            None => error!("retain of dead handle {:?}", handle),
        }
    }

    pub fn release(&mut self, handle: ObjectHandle) {
        let destroy = match self.slot_mut(handle) {
            Some(slot) => {
                if slot.refs > 0 {
                    slot.refs -= 1;
                }
                slot.refs == 0
            }
            None => {
                error!("release of dead handle {:?}", handle);
                false
            }
        };

        if destroy {
            trace!("destroying {:?}", handle);
            if let Some(slot) = self.slots[handle.0 as usize].take() {
                self.free.push(handle.0);
                self.teardown(slot.object);
            }
        }
    }

    pub fn ref_count(&self, handle: ObjectHandle) -> u32 {
        self.slot(handle).map(|s| s.refs).unwrap_or(0)
    }

    pub fn live_objects(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn definition(&self, handle: ObjectHandle) -> Option<&StructDefinition> {
        match self.slot(handle) {
            Some(ArenaSlot {
                object: ArenaObject::Definition(def),
                ..
            }) => Some(def),
            _ => None,
        }
    }

    pub fn instance(&self, handle: ObjectHandle) -> Option<&InstanceObject> {
        match self.slot(handle) {
            Some(ArenaSlot {
                object: ArenaObject::Instance(inst),
                ..
            }) => Some(inst),
            _ => None,
        }
    }

    /// Release every reference embedded in instance data laid out by
    /// `definition`, recursing through nested aggregates. No-op unless the
    /// definition is flagged as needing teardown.
    pub fn destruct_embedded(&mut self, definition: ObjectHandle, data: &[u8]) {
        self.walk_embedded(definition, data, false);
    }

    /// Retain every reference embedded in instance data; the mirror of
    /// [`ObjectArena::destruct_embedded`], used when instance bytes are
    /// duplicated onto the stack or into another aggregate.
    pub fn retain_embedded(&mut self, definition: ObjectHandle, data: &[u8]) {
        self.walk_embedded(definition, data, true);
    }

    fn walk_embedded(&mut self, definition: ObjectHandle, data: &[u8], retain: bool) {
        let plan = match self.definition(definition) {
            Some(def) if def.flags.contains(StructFlags::NEEDS_DROP) => def.fields.clone(),
            _ => return,
        };

        for field in plan {
            match field.type_info.tag.base() {
                BaseTag::Struct | BaseTag::Object => {
                    let bits = read_field_bits(data, &field);
                    let target = ObjectHandle::from_bits(bits);
                    if retain {
                        self.retain(target);
                    } else {
                        self.release(target);
                    }
                }
                BaseTag::StructInstance => {
                    if let Some(nested) = field.type_info.definition {
                        let size = self
                            .definition(nested)
                            .map(|d| d.instance_size)
                            .unwrap_or(0);
                        let start = field.offset.min(data.len());
                        let end = (field.offset + size).min(data.len());
                        let slice = data[start..end].to_vec();
                        self.walk_embedded(nested, &slice, retain);
                    }
                }
                _ => {}
            }
        }
    }

    fn teardown(&mut self, object: ArenaObject) {
        match object {
            ArenaObject::Definition(def) => {
                if def.flags.contains(StructFlags::NEEDS_DROP) {
                    for field in &def.statics {
                        if field.type_info.tag.is_reference() {
                            let bits = read_field_bits(&def.static_data, field);
                            self.release(ObjectHandle::from_bits(bits));
                        }
                    }
                }

                // schema-held definition references
                for field in def.fields.iter().chain(def.statics.iter()) {
                    if let Some(nested) = field.type_info.definition {
                        self.release(nested);
                    }
                }
            }
            ArenaObject::Instance(inst) => {
                self.destruct_embedded(inst.definition, &inst.data);
                self.release(inst.definition);
            }
        }
    }

    fn slot(&self, handle: ObjectHandle) -> Option<&ArenaSlot> {
        self.slots.get(handle.0 as usize).and_then(|s| s.as_ref())
    }

    fn slot_mut(&mut self, handle: ObjectHandle) -> Option<&mut ArenaSlot> {
        self.slots
            .get_mut(handle.0 as usize)
            .and_then(|s| s.as_mut())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::script::mem::schema::{write_field_bits, TypeInfo};
    use crate::script::mem::Tag;

    #[test]
    fn first_retain_brings_the_count_to_one() {
        let mut arena = ObjectArena::new();
        let handle = arena.create(ArenaObject::Definition(StructDefinition::new(None)));

        assert_eq!(arena.ref_count(handle), 0);
        arena.retain(handle);
        assert_eq!(arena.ref_count(handle), 1);

        arena.release(handle);
        assert_eq!(arena.live_objects(), 0);
    }

    #[test]
    fn slots_are_reused_after_release() {
        let mut arena = ObjectArena::new();
        let first = arena.create(ArenaObject::Definition(StructDefinition::new(None)));
        arena.retain(first);
        arena.release(first);

        let second = arena.create(ArenaObject::Definition(StructDefinition::new(None)));
        assert_eq!(first.to_bits(), second.to_bits());
        assert_eq!(arena.live_objects(), 1);
    }

    #[test]
    fn instance_teardown_releases_its_definition() {
        let mut arena = ObjectArena::new();
        let def = arena.create(ArenaObject::Definition(StructDefinition::new(None)));
        arena.retain(def);

        arena.retain(def); // held by the instance below
        let inst = arena.create(ArenaObject::Instance(InstanceObject {
            definition: def,
            data: Vec::new(),
        }));
        arena.retain(inst);
        assert_eq!(arena.ref_count(def), 2);

        arena.release(inst);
        assert_eq!(arena.ref_count(def), 1);

        arena.release(def);
        assert_eq!(arena.live_objects(), 0);
    }

    #[test]
    fn flagged_instance_data_releases_embedded_references() {
        let mut arena = ObjectArena::new();
        let inner = arena.create(ArenaObject::Definition(StructDefinition::new(None)));
        arena.retain(inner);

        let mut outer_def = StructDefinition::new(None);
        outer_def.push_field("child".to_string(), TypeInfo::native(Tag::STRUCT), 8, true);
        let outer = arena.create(ArenaObject::Definition(outer_def));
        arena.retain(outer);

        // instance data holding one retained reference to `inner`
        arena.retain(inner);
        let mut data = vec![0u8; 8];
        let field = arena.definition(outer).unwrap().fields[0].clone();
        write_field_bits(&mut data, &field, inner.to_bits());
        assert_eq!(arena.ref_count(inner), 2);

        arena.destruct_embedded(outer, &data);
        assert_eq!(arena.ref_count(inner), 1);

        arena.release(outer);
        arena.release(inner);
        assert_eq!(arena.live_objects(), 0);
    }

    #[test]
    fn definition_teardown_releases_static_references() {
        let mut arena = ObjectArena::new();
        let target = arena.create(ArenaObject::Definition(StructDefinition::new(None)));
        arena.retain(target);

        let mut def = StructDefinition::new(None);
        def.push_static("linked".to_string(), TypeInfo::native(Tag::STRUCT), 8);
        def.static_data = vec![0u8; 8];
        let field = def.statics[0].clone();
        write_field_bits(&mut def.static_data, &field, target.to_bits());

        arena.retain(target); // held by static_data
        let holder = arena.create(ArenaObject::Definition(def));
        arena.retain(holder);
        assert_eq!(arena.ref_count(target), 2);

        arena.release(holder);
        assert_eq!(arena.ref_count(target), 1);

        arena.release(target);
        assert_eq!(arena.live_objects(), 0);
    }
}
