use crate::sequencing::SequenceId;

/// A fixed-capacity ring of per-sequence entries, indexed by
///  `sequence % capacity`. Writing a sequence whose slot is occupied by a
///  different sequence evicts that older entry - entries falling out of the
///  representable span are simply forgotten, which is the intended behavior
///  for both dedup bookkeeping (old sequences become unverifiable and are
///  dropped by the watermark check anyway) and retransmit bookkeeping (the
///  send window bounds how many entries can be live at once).
///
/// Used with `T = bool` for duplicate detection and with richer payloads
///  (retained buffers, retransmit timers) by the reliable variants.
pub struct SlidingWindow<T> {
    slots: Vec<Option<(SequenceId, T)>>,
    len: usize,
}

impl<T> SlidingWindow<T> {
    pub fn new(capacity: usize) -> SlidingWindow<T> {
        assert!(capacity > 0 && capacity <= 32768,
                "window capacity must be in 1..=32768 to keep wraparound comparisons well-defined");

        SlidingWindow {
            slots: (0..capacity).map(|_| None).collect(),
            len: 0,
        }
    }

    fn slot_index(&self, sequence: SequenceId) -> usize {
        sequence.to_raw() as usize % self.slots.len()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, sequence: SequenceId) -> bool {
        matches!(&self.slots[self.slot_index(sequence)], Some((s, _)) if *s == sequence)
    }

    pub fn get(&self, sequence: SequenceId) -> Option<&T> {
        match &self.slots[self.slot_index(sequence)] {
            Some((s, value)) if *s == sequence => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, sequence: SequenceId) -> Option<&mut T> {
        let index = self.slot_index(sequence);
        match &mut self.slots[index] {
            Some((s, value)) if *s == sequence => Some(value),
            _ => None,
        }
    }

    /// stores a value for a sequence, returning whatever entry previously
    ///  occupied the slot - either the same sequence's old value or an evicted
    ///  older sequence. Callers holding pooled buffers in the window drain the
    ///  returned entry back to the pool.
    pub fn set(&mut self, sequence: SequenceId, value: T) -> Option<(SequenceId, T)> {
        let index = self.slot_index(sequence);
        let evicted = self.slots[index].replace((sequence, value));
        if evicted.is_none() {
            self.len += 1;
        }
        evicted
    }

    pub fn remove(&mut self, sequence: SequenceId) -> Option<T> {
        let index = self.slot_index(sequence);
        match &self.slots[index] {
            Some((s, _)) if *s == sequence => {
                self.len -= 1;
                self.slots[index].take().map(|(_, value)| value)
            }
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (SequenceId, &T)> {
        self.slots.iter()
            .filter_map(|slot| slot.as_ref().map(|(s, value)| (*s, value)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (SequenceId, &mut T)> {
        self.slots.iter_mut()
            .filter_map(|slot| slot.as_mut().map(|(s, value)| (*s, value)))
    }

    /// removes and yields all live entries
    pub fn drain(&mut self) -> impl Iterator<Item = (SequenceId, T)> + '_ {
        self.len = 0;
        self.slots.iter_mut().filter_map(|slot| slot.take())
    }
}
