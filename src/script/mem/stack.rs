use crate::script::mem::schema::data_cells;
use crate::script::mem::{BaseTag, ObjectArena, ObjectHandle, Tag};
use crate::script::ErrorKind;

pub const STACK_CAPACITY: usize = 256;

/// View of one value on the stack: its slot tag, the index of its first
/// cell and how many cells it spans. Views are plain indices, so holding
/// one never blocks mutation; they go stale after the value is popped.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StackValue {
    pub tag: Tag,
    pub base: usize,
    pub span: usize,
}

/// Fixed-capacity evaluation stack: 64-bit cells in lockstep with a tag per
/// cell. Aggregate instances span several cells, all tagged
/// `StructInstance` except the terminal `StructEnd` cell. Every push of a
/// reference-carrying value retains it; every pop or overwrite releases it.
pub struct ValueStack {
    cells: Box<[u64]>,
    tags: Box<[Tag]>,
    top: usize,
}

impl Default for ValueStack {
    fn default() -> Self {
        ValueStack {
            cells: vec![0u64; STACK_CAPACITY].into_boxed_slice(),
            tags: vec![Tag::ACQUIRE; STACK_CAPACITY].into_boxed_slice(),
            top: 0,
        }
    }
}

impl ValueStack {
    pub fn new() -> Self {
        ValueStack::default()
    }

    pub fn top(&self) -> usize {
        self.top
    }

    pub fn is_empty(&self) -> bool {
        self.top == 0
    }

    pub fn cell(&self, index: usize) -> u64 {
        self.cells[index]
    }

    pub(crate) fn set_cell(&mut self, index: usize, bits: u64) {
        self.cells[index] = bits;
    }

    pub fn tag(&self, index: usize) -> Tag {
        self.tags[index]
    }

    pub(crate) fn set_tag(&mut self, index: usize, tag: Tag) {
        self.tags[index] = tag;
    }

    /// Move `top` without destructing anything. Used where existing cells
    /// are re-adopted in place (declarations, parameter binding, static
    /// data capture); everything else goes through [`ValueStack::pop`].
    pub(crate) fn set_top(&mut self, top: usize) {
        self.top = top;
    }

    /// Resolve the value at or around `index`: a `StructEnd` cell scans
    /// back to the leading cell, a `StructInstance` cell scans forward to
    /// the matching sentinel.
    pub fn value_at(&self, index: usize) -> StackValue {
        match self.tags[index].base() {
            BaseTag::StructEnd => {
                let mut base = index;
                while base > 0 && self.tags[base - 1].base() == BaseTag::StructInstance {
                    base -= 1;
                }
                StackValue {
                    tag: self.tags[base],
                    base,
                    span: index - base + 1,
                }
            }
            BaseTag::StructInstance => {
                let mut end = index + 1;
                while end < self.tags.len() && self.tags[end].base() == BaseTag::StructInstance {
                    end += 1;
                }
                let span = if end < self.tags.len() && self.tags[end].base() == BaseTag::StructEnd {
                    end - index + 1
                } else {
                    1
                };
                StackValue {
                    tag: self.tags[index],
                    base: index,
                    span,
                }
            }
            _ => StackValue {
                tag: self.tags[index],
                base: index,
                span: 1,
            },
        }
    }

    pub fn last_value(&self) -> Result<StackValue, ErrorKind> {
        if self.top == 0 {
            return Err(ErrorKind::StackUnderflow);
        }
        Ok(self.value_at(self.top - 1))
    }

    /// Push a single-cell value. Reference tags retain their target.
    pub fn push_cell(
        &mut self,
        arena: &mut ObjectArena,
        tag: Tag,
        bits: u64,
    ) -> Result<usize, ErrorKind> {
        debug_assert!(tag.base() != BaseTag::StructInstance && tag.base() != BaseTag::StructEnd);

        if self.top >= STACK_CAPACITY {
            return Err(ErrorKind::StackOverflow);
        }

        let index = self.top;
        self.cells[index] = bits;
        self.tags[index] = tag.strip_dynamic();
        self.top += 1;

        if tag.is_reference() {
            arena.retain(ObjectHandle::from_bits(bits));
        }

        trace!("pushed [{}] {:?} (bits: {:#x})", index, tag, bits);
        Ok(index)
    }

    /// Push an inline aggregate instance: leading definition-reference
    /// cell, packed field bytes, terminal sentinel. Retains the definition
    /// and any references embedded in the field bytes.
    pub fn push_instance(
        &mut self,
        arena: &mut ObjectArena,
        definition: ObjectHandle,
        data: &[u8],
    ) -> Result<usize, ErrorKind> {
        let span = 1 + data_cells(data.len()).max(1);
        if self.top + span > STACK_CAPACITY {
            return Err(ErrorKind::StackOverflow);
        }

        let index = self.top;
        self.cells[index] = definition.to_bits();
        self.tags[index] = Tag::STRUCT_INSTANCE;

        for i in 0..span - 1 {
            let mut chunk = [0u8; 8];
            let lo = i * 8;
            let hi = (lo + 8).min(data.len());
            if lo < data.len() {
                chunk[..hi - lo].copy_from_slice(&data[lo..hi]);
            }
            self.cells[index + 1 + i] = u64::from_le_bytes(chunk);
            self.tags[index + 1 + i] = Tag::STRUCT_INSTANCE;
        }

        self.tags[index + span - 1] = Tag::STRUCT_END;
        self.top += span;

        arena.retain(definition);
        arena.retain_embedded(definition, data);

        trace!("pushed [{}] instance of {:?} (span: {})", index, definition, span);
        Ok(index)
    }

    /// Push a copy of a value already on the stack. The copy carries base
    /// tags only; dynamic flags stay with the source slot.
    pub fn push_copy(
        &mut self,
        arena: &mut ObjectArena,
        src: StackValue,
    ) -> Result<usize, ErrorKind> {
        if self.top + src.span > STACK_CAPACITY {
            return Err(ErrorKind::StackOverflow);
        }

        let index = self.top;
        for i in 0..src.span {
            self.cells[index + i] = self.cells[src.base + i];
            self.tags[index + i] = self.tags[src.base + i].strip_dynamic();
        }
        self.top += src.span;

        let copy = self.value_at(index);
        self.retain_value(arena, copy);
        Ok(index)
    }

    /// Destruct the value at `index` in place: release the references it
    /// holds without moving `top`.
    pub fn unset(&mut self, arena: &mut ObjectArena, index: usize) {
        let value = self.value_at(index);
        match value.tag.base() {
            BaseTag::Struct | BaseTag::Object => {
                arena.release(ObjectHandle::from_bits(self.cells[value.base]));
            }
            BaseTag::StructInstance => {
                let definition = ObjectHandle::from_bits(self.cells[value.base]);
                let data = self.instance_data(value);
                arena.destruct_embedded(definition, &data);
                arena.release(definition);
            }
            _ => {}
        }
    }

    pub fn pop(&mut self, arena: &mut ObjectArena) -> Result<StackValue, ErrorKind> {
        let value = self.last_value()?;
        self.unset(arena, value.base);
        self.top = value.base;

        trace!("popped {:?} (span: {}, top: {})", value.tag, value.span, self.top);
        Ok(value)
    }

    /// Overwrite the value at `index` with a copy of `src`: assignability
    /// first, then destruction of the old value, then the write. The slot
    /// keeps its dynamic flag.
    pub fn set_from(
        &mut self,
        arena: &mut ObjectArena,
        index: usize,
        src: StackValue,
    ) -> Result<(), ErrorKind> {
        let dst = self.value_at(index);
        let merged = dst.tag.merge(src.tag)?;
        // storage is fixed at declaration; a dynamic slot rebinds its kind
        // but cannot change its cell span in place
        if dst.span != src.span {
            return Err(ErrorKind::TypeMismatch);
        }

        self.unset(arena, index);

        for i in 0..src.span {
            self.cells[index + i] = self.cells[src.base + i];
            self.tags[index + i] = self.tags[src.base + i].strip_dynamic();
        }
        self.tags[index] = merged;

        let written = self.value_at(index);
        self.retain_value(arena, written);
        Ok(())
    }

    /// Pop values (with destruction) until `top` is back at `target`.
    pub fn truncate_to(&mut self, arena: &mut ObjectArena, target: usize) {
        while self.top > target {
            if self.pop(arena).is_err() {
                break;
            }
        }
    }

    /// Frame cleanup shared by calls and blocks: destruct every value in
    /// `[frame_base, keep_from)` and shift the surviving values down so
    /// they start at `frame_base`.
    pub fn collapse_frame(&mut self, arena: &mut ObjectArena, frame_base: usize, keep_from: usize) {
        let keep_from = keep_from.min(self.top);
        debug_assert!(frame_base <= keep_from);

        let mut index = frame_base;
        while index < keep_from {
            let value = self.value_at(index);
            self.unset(arena, index);
            index += value.span;
        }

        let preserved = self.top - keep_from;
        for i in 0..preserved {
            self.cells[frame_base + i] = self.cells[keep_from + i];
            self.tags[frame_base + i] = self.tags[keep_from + i];
        }
        self.top = frame_base + preserved;

        debug!(
            "collapsed frame at {} ({} preserved cell(s))",
            frame_base, preserved
        );
    }

    /// Field bytes of an inline instance, padded to whole cells.
    pub fn instance_data(&self, value: StackValue) -> Vec<u8> {
        let mut data = Vec::with_capacity(value.span.saturating_sub(1) * 8);
        for i in value.base + 1..value.base + value.span {
            data.extend_from_slice(&self.cells[i].to_le_bytes());
        }
        data
    }

    /// Read-only walk from the top of the stack downward, one value at a
    /// time (the last pushed value first).
    pub fn iter(&self) -> StackIter<'_> {
        StackIter {
            stack: self,
            index: self.top,
        }
    }

    fn retain_value(&self, arena: &mut ObjectArena, value: StackValue) {
        match value.tag.base() {
            BaseTag::Struct | BaseTag::Object => {
                arena.retain(ObjectHandle::from_bits(self.cells[value.base]));
            }
            BaseTag::StructInstance => {
                let definition = ObjectHandle::from_bits(self.cells[value.base]);
                arena.retain(definition);
                let data = self.instance_data(value);
                arena.retain_embedded(definition, &data);
            }
            _ => {}
        }
    }

    pub fn debug_print(&self) {
        debug!("Value stack: {}/{}", self.top, STACK_CAPACITY);
        let values: Vec<StackValue> = self.iter().collect();
        for value in values.into_iter().rev() {
            debug!(
                "\t{}:\t{:?} (span: {}, bits: {:#x})",
                value.base, value.tag, value.span, self.cells[value.base]
            );
        }
    }
}

pub struct StackIter<'a> {
    stack: &'a ValueStack,
    index: usize,
}

impl Iterator for StackIter<'_> {
    type Item = StackValue;

    fn next(&mut self) -> Option<StackValue> {
        if self.index == 0 {
            return None;
        }

        let value = self.stack.value_at(self.index - 1);
        self.index = value.base;
        Some(value)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::script::mem::schema::{StructDefinition, TypeInfo};
    use crate::script::mem::{decode_i32, encode_i32, ArenaObject};

    fn empty_definition(arena: &mut ObjectArena) -> ObjectHandle {
        arena.create(ArenaObject::Definition(StructDefinition::new(None)))
    }

    #[test]
    fn push_pop_round_trip() {
        let mut arena = ObjectArena::new();
        let mut stack = ValueStack::new();

        stack.push_cell(&mut arena, Tag::I32, encode_i32(-42)).unwrap();
        let value = stack.last_value().unwrap();
        assert_eq!(value.tag, Tag::I32);
        assert_eq!(decode_i32(stack.cell(value.base)), -42);

        stack.pop(&mut arena).unwrap();
        assert!(stack.is_empty());
        assert_eq!(stack.pop(&mut arena), Err(ErrorKind::StackUnderflow));
    }

    #[test]
    fn reference_cells_retain_and_release() {
        let mut arena = ObjectArena::new();
        let mut stack = ValueStack::new();
        let def = empty_definition(&mut arena);

        stack.push_cell(&mut arena, Tag::STRUCT, def.to_bits()).unwrap();
        assert_eq!(arena.ref_count(def), 1);

        let value = stack.last_value().unwrap();
        stack.push_copy(&mut arena, value).unwrap();
        assert_eq!(arena.ref_count(def), 2);

        stack.pop(&mut arena).unwrap();
        stack.pop(&mut arena).unwrap();
        assert_eq!(arena.live_objects(), 0);
    }

    #[test]
    fn instance_spans_resolve_from_both_ends() {
        let mut arena = ObjectArena::new();
        let mut stack = ValueStack::new();

        let mut def = StructDefinition::new(None);
        def.push_field("a".to_string(), TypeInfo::native(Tag::I64), 8, false);
        def.push_field("b".to_string(), TypeInfo::native(Tag::I32), 4, false);
        let def = arena.create(ArenaObject::Definition(def));

        let data = vec![7u8; 12];
        let base = stack.push_instance(&mut arena, def, &data).unwrap();
        // leading cell + two data cells, the second doubling as the sentinel
        assert_eq!(stack.top(), 3);
        assert_eq!(stack.tag(base).base(), BaseTag::StructInstance);
        assert_eq!(stack.tag(base + 2).base(), BaseTag::StructEnd);

        let from_end = stack.value_at(stack.top() - 1);
        let from_base = stack.value_at(base);
        assert_eq!(from_end, from_base);
        assert_eq!(from_end.span, 3);

        stack.pop(&mut arena).unwrap();
        assert!(stack.is_empty());
        assert_eq!(arena.live_objects(), 0);
    }

    #[test]
    fn set_rejects_mismatched_kinds() {
        let mut arena = ObjectArena::new();
        let mut stack = ValueStack::new();

        let slot = stack.push_cell(&mut arena, Tag::I32, encode_i32(1)).unwrap();
        stack.push_cell(&mut arena, Tag::F64, 0).unwrap();
        let src = stack.last_value().unwrap();

        assert_eq!(stack.set_from(&mut arena, slot, src), Err(ErrorKind::TypeMismatch));
        assert_eq!(decode_i32(stack.cell(slot)), 1);
    }

    #[test]
    fn dynamic_slot_accepts_any_kind() {
        let mut arena = ObjectArena::new();
        let mut stack = ValueStack::new();

        let slot = stack
            .push_cell(&mut arena, Tag::I32.with_dynamic(), encode_i32(1))
            .unwrap();
        // pushes strip the flag; re-mark the slot the way declarations do
        stack.set_tag(slot, Tag::I32.with_dynamic());

        stack.push_cell(&mut arena, Tag::F64, 0x7ff8_0000_0000_0000).unwrap();
        let src = stack.last_value().unwrap();
        stack.set_from(&mut arena, slot, src).unwrap();

        assert!(stack.tag(slot).is_dynamic());
        assert_eq!(stack.tag(slot).base(), BaseTag::F64);
    }

    #[test]
    fn dynamic_slots_cannot_change_span() {
        let mut arena = ObjectArena::new();
        let mut stack = ValueStack::new();

        let slot = stack.push_cell(&mut arena, Tag::I32, encode_i32(2)).unwrap();
        stack.set_tag(slot, Tag::I32.with_dynamic());

        let mut def = StructDefinition::new(None);
        def.push_field("a".to_string(), TypeInfo::native(Tag::I32), 4, false);
        let def = arena.create(ArenaObject::Definition(def));
        stack.push_instance(&mut arena, def, &[0u8; 4]).unwrap();
        let src = stack.last_value().unwrap();

        // the dynamic slot accepts the tag but not the wider span
        assert_eq!(stack.set_from(&mut arena, slot, src), Err(ErrorKind::TypeMismatch));
        assert_eq!(decode_i32(stack.cell(slot)), 2);
        assert!(stack.tag(slot).is_dynamic());

        stack.pop(&mut arena).unwrap();
        assert_eq!(arena.live_objects(), 0);
    }

    #[test]
    fn collapse_preserves_returns_and_releases_arguments() {
        let mut arena = ObjectArena::new();
        let mut stack = ValueStack::new();
        let def = empty_definition(&mut arena);

        let frame_base = stack.top();
        stack.push_cell(&mut arena, Tag::STRUCT, def.to_bits()).unwrap(); // argument
        stack.push_cell(&mut arena, Tag::I32, encode_i32(3)).unwrap(); // argument
        stack.push_cell(&mut arena, Tag::I32, encode_i32(99)).unwrap(); // return value

        stack.collapse_frame(&mut arena, frame_base, frame_base + 2);

        assert_eq!(stack.top(), frame_base + 1);
        let result = stack.last_value().unwrap();
        assert_eq!(result.tag, Tag::I32);
        assert_eq!(decode_i32(stack.cell(result.base)), 99);
        assert_eq!(arena.live_objects(), 0);
    }

    #[test]
    fn iterator_walks_top_down() {
        let mut arena = ObjectArena::new();
        let mut stack = ValueStack::new();

        stack.push_cell(&mut arena, Tag::I32, encode_i32(1)).unwrap();
        stack.push_cell(&mut arena, Tag::I32, encode_i32(2)).unwrap();
        stack.push_cell(&mut arena, Tag::I32, encode_i32(3)).unwrap();

        let seen: Vec<i32> = stack.iter().map(|v| decode_i32(stack.cell(v.base))).collect();
        assert_eq!(seen, vec![3, 2, 1]);
    }

    #[test]
    fn overflow_is_reported() {
        let mut arena = ObjectArena::new();
        let mut stack = ValueStack::new();

        for i in 0..STACK_CAPACITY {
            stack.push_cell(&mut arena, Tag::I32, i as u64).unwrap();
        }
        assert_eq!(
            stack.push_cell(&mut arena, Tag::I32, 0),
            Err(ErrorKind::StackOverflow)
        );
    }
}
