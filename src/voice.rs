//! Voices and the Voice Pool
//!
//! A voice is the per-note render state of one processor. All voices that
//! together realize a single note within one audio unit share a nonzero
//! group id and live and die atomically: stealing any member resets the
//! whole group, so one processor's phase can never outlive its
//! force-envelope peer.
//!
//! The pool is a fixed-size bank of voice slots with priority-based
//! stealing and grouped iteration. Sorting clusters each group into a
//! contiguous run, which both makes iteration trivial and lets the group
//! runs be split into disjoint mutable slices for worker threads.

use crate::processors::VoiceStateData;
use crate::rng::Rng;
use crate::work_buffer::WorkBuffer;

use std::ops::Range;

/// Voice scheduling priority. Lower priorities are stolen first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum VoicePriority {
    /// Available for immediate reuse.
    #[default]
    Inactive,
    /// Released; still rendering its release tail.
    Bg,
    /// In the foreground, note on.
    Fg,
    /// Just activated; protected from stealing until first render.
    New,
}

/// A single per-group, per-processor render state.
#[derive(Debug)]
pub struct Voice {
    prio: VoicePriority,
    group_id: u64,
    /// Channel that started the note.
    pub channel: usize,
    /// Audio unit the voice renders inside.
    pub au_index: usize,
    /// Processor within the audio unit.
    pub proc_index: usize,
    /// Frame offset of the note-on within the current render slice.
    pub frame_offset: usize,
    /// Whether the processor still produces signal; cleared by the
    /// processor itself when the note has ended.
    pub active: bool,
    /// Per-processor note state.
    pub state: VoiceStateData,
    /// Voice-local random state.
    pub rng: Rng,
    /// Internal scratch slab for the voice's processor.
    pub work_buffer: Option<WorkBuffer>,
}

impl Voice {
    pub fn new() -> Self {
        Self {
            prio: VoicePriority::Inactive,
            group_id: 0,
            channel: 0,
            au_index: 0,
            proc_index: 0,
            frame_offset: 0,
            active: false,
            state: VoiceStateData::None,
            rng: Rng::default(),
            work_buffer: None,
        }
    }

    pub fn prio(&self) -> VoicePriority {
        self.prio
    }

    pub fn set_prio(&mut self, prio: VoicePriority) {
        self.prio = prio;
    }

    /// Group id; 0 means the slot is free.
    pub fn group_id(&self) -> u64 {
        self.group_id
    }

    /// Initialize the voice for a fresh note.
    pub fn init(
        &mut self,
        channel: usize,
        au_index: usize,
        proc_index: usize,
        state: VoiceStateData,
        rng: Rng,
        frame_offset: usize,
    ) {
        self.prio = VoicePriority::New;
        self.channel = channel;
        self.au_index = au_index;
        self.proc_index = proc_index;
        self.frame_offset = frame_offset;
        self.active = true;
        self.state = state;
        self.rng = rng;
    }

    /// Return the voice to the free state. The work buffer is kept.
    pub fn reset(&mut self) {
        self.prio = VoicePriority::Inactive;
        self.group_id = 0;
        self.frame_offset = 0;
        self.active = false;
        self.state = VoiceStateData::None;
    }
}

impl Default for Voice {
    fn default() -> Self {
        Self::new()
    }
}

/// Sort key placing free slots (group id 0) last.
#[inline]
fn group_sort_key(voice: &Voice) -> u64 {
    // Overflow group id 0 to maximum so that inactive voices sink.
    voice.group_id.wrapping_sub(1)
}

/// A fixed-size bank of voice slots.
#[derive(Debug, Default)]
pub struct VoicePool {
    voices: Vec<Voice>,
    new_group_id: u64,
    group_iter_offset: usize,
    work_buffer_size: usize,
}

impl VoicePool {
    pub fn new(size: usize) -> Self {
        Self {
            voices: (0..size).map(|_| Voice::new()).collect(),
            new_group_id: 0,
            group_iter_offset: 0,
            work_buffer_size: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.voices.len()
    }

    /// Change the pool size between renders. Shrinking drops the highest
    /// slots; growing adds fresh voices with the current work buffer size.
    pub fn resize(&mut self, size: usize) {
        let old_size = self.voices.len();
        self.voices.resize_with(size, Voice::new);
        if self.work_buffer_size > 0 {
            for voice in self.voices.iter_mut().skip(old_size) {
                voice.work_buffer = Some(WorkBuffer::new(self.work_buffer_size));
            }
        }
    }

    /// Allocate one internal scratch buffer per voice slot.
    pub fn reserve_work_buffers(&mut self, buffer_size: usize) {
        self.work_buffer_size = buffer_size;
        if buffer_size == 0 {
            for voice in &mut self.voices {
                voice.work_buffer = None;
            }
            return;
        }
        for voice in &mut self.voices {
            match &mut voice.work_buffer {
                Some(wb) if wb.len() == buffer_size => {}
                slot => *slot = Some(WorkBuffer::new(buffer_size)),
            }
        }
    }

    pub fn work_buffer_size(&self) -> usize {
        self.work_buffer_size
    }

    /// A fresh nonzero group id.
    pub fn new_group_id(&mut self) -> u64 {
        self.new_group_id += 1;
        self.new_group_id
    }

    /// Acquire a slot for the given group.
    ///
    /// Picks the voice of lowest priority among all slots outside the
    /// group (ties broken by position). If the chosen voice belongs to
    /// another group, that entire group is reset first, preserving
    /// inter-processor coherency. Returns `None` for an empty pool.
    pub fn get_voice(&mut self, group_id: u64) -> Option<usize> {
        debug_assert!(group_id != 0);

        if self.voices.is_empty() {
            return None;
        }

        let mut chosen: Option<usize> = None;
        let mut chosen_prio = VoicePriority::New;
        let mut found = false;
        for (i, voice) in self.voices.iter().enumerate() {
            if voice.group_id == group_id {
                continue;
            }
            if !found || voice.prio < chosen_prio {
                chosen = Some(i);
                chosen_prio = voice.prio;
                found = true;
            }
        }

        let index = chosen?;
        let victim_group = self.voices[index].group_id;
        if victim_group != 0 {
            self.reset_group(victim_group);
        }

        let voice = &mut self.voices[index];
        voice.prio = VoicePriority::Inactive;
        voice.group_id = group_id;
        Some(index)
    }

    pub fn voice(&self, index: usize) -> &Voice {
        &self.voices[index]
    }

    pub fn voice_mut(&mut self, index: usize) -> &mut Voice {
        &mut self.voices[index]
    }

    pub fn voices(&self) -> &[Voice] {
        &self.voices
    }

    pub fn voices_mut(&mut self) -> &mut [Voice] {
        &mut self.voices
    }

    /// Reset every member of one group.
    pub fn reset_group(&mut self, group_id: u64) {
        debug_assert!(group_id != 0);
        for voice in &mut self.voices {
            if voice.group_id == group_id {
                voice.reset();
            }
        }
    }

    /// Set the priority of every member of one group, e.g. demoting a
    /// released note to the background.
    pub fn set_group_prio(&mut self, group_id: u64, prio: VoicePriority) {
        debug_assert!(group_id != 0);
        for voice in &mut self.voices {
            if voice.group_id == group_id {
                voice.prio = prio;
            }
        }
    }

    /// Whether any member of the group still renders signal.
    pub fn group_is_active(&self, group_id: u64) -> bool {
        self.voices
            .iter()
            .any(|v| v.group_id == group_id && v.active)
    }

    /// Free all slots whose priority dropped to inactive.
    pub fn free_inactive(&mut self) {
        for voice in &mut self.voices {
            if voice.prio == VoicePriority::Inactive {
                voice.reset();
            }
        }
    }

    /// Reset the whole pool.
    pub fn reset(&mut self) {
        for voice in &mut self.voices {
            voice.reset();
        }
        self.group_iter_offset = 0;
    }

    /// Stable insertion sort clustering each group into a contiguous run,
    /// free slots last.
    pub fn sort_groups(&mut self) {
        for i in 1..self.voices.len() {
            let mut target = i;
            while target > 0
                && group_sort_key(&self.voices[target - 1]) > group_sort_key(&self.voices[target])
            {
                self.voices.swap(target - 1, target);
                target -= 1;
            }
        }
    }

    /// Sort groups and rewind the group iterator.
    pub fn start_group_iteration(&mut self) {
        self.sort_groups();
        self.group_iter_offset = 0;
    }

    /// The index range of the next group in sorted order, or `None` when
    /// only free slots remain.
    pub fn next_group(&mut self) -> Option<Range<usize>> {
        let start = self.group_iter_offset;
        if start >= self.voices.len() {
            return None;
        }
        let group_id = self.voices[start].group_id;
        if group_id == 0 {
            return None;
        }
        let len = self.voices[start..]
            .iter()
            .take_while(|v| v.group_id == group_id)
            .count();
        self.group_iter_offset = start + len;
        Some(start..start + len)
    }

    /// Whether every member of a group run has left the foreground.
    fn range_is_bg(&self, range: &Range<usize>) -> bool {
        self.voices[range.clone()]
            .iter()
            .all(|v| v.prio <= VoicePriority::Bg)
    }

    /// The next group that still has foreground members, for rendering
    /// order control.
    pub fn next_fg_group(&mut self) -> Option<Range<usize>> {
        loop {
            let range = self.next_group()?;
            if !self.range_is_bg(&range) {
                return Some(range);
            }
        }
    }

    /// The next fully released group.
    pub fn next_bg_group(&mut self) -> Option<Range<usize>> {
        loop {
            let range = self.next_group()?;
            if self.range_is_bg(&range) {
                return Some(range);
            }
        }
    }

    /// Split the sorted pool into one disjoint mutable slice per group,
    /// ready to be handed out to worker threads. Must be called after
    /// [`VoicePool::sort_groups`].
    pub fn group_slices(&mut self) -> Vec<&mut [Voice]> {
        let mut out = Vec::new();
        let mut rest: &mut [Voice] = self.voices.as_mut_slice();
        while !rest.is_empty() && rest[0].group_id != 0 {
            let group_id = rest[0].group_id;
            let len = rest
                .iter()
                .take_while(|v| v.group_id == group_id)
                .count();
            let (head, tail) = std::mem::take(&mut rest).split_at_mut(len);
            out.push(head);
            rest = tail;
        }
        out
    }
}
