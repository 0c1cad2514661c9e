//! Device Runtime State
//!
//! The module description is read-only while audio renders; everything a
//! render call mutates lives here. Each device gets one [`DeviceState`]
//! (DSP history, audio-unit bypass) plus one [`DeviceThreadState`] per
//! render thread holding the actual signal buffers and the graph-walk
//! color. Thread states are partitioned by thread index so workers never
//! share scratch; mixed-path buffers are only rendered on thread 0, while
//! worker threads accumulate voice output into their own copies that are
//! merged after the join.

use crate::device::DeviceId;
use crate::work_buffer::WorkBuffer;
use crate::DEVICE_PORTS_MAX;

/// Graph-walk color of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeState {
    #[default]
    New,
    /// Entered but not finished; reaching a node in this state again means
    /// the graph has a cycle.
    Reached,
    Visited,
}

/// Per-device mutable runtime state shared by all threads.
#[derive(Debug, Clone, Default)]
pub struct DeviceState {
    /// Audio units only: copy receive ports straight to send ports,
    /// skipping the interior graph.
    pub bypass: bool,
}

impl DeviceState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Per-(device, thread) scratch: signal buffers and walk bookkeeping.
#[derive(Debug, Default)]
pub struct DeviceThreadState {
    pub node_state: NodeState,
    /// Whether this device produced mixed output during the current slice.
    pub has_mixed_audio: bool,
    in_connected: u32,
    mixed_in: Vec<Option<WorkBuffer>>,
    mixed_out: Vec<Option<WorkBuffer>>,
    voice_in: Vec<Option<WorkBuffer>>,
    voice_out: Vec<Option<WorkBuffer>>,
}

impl DeviceThreadState {
    pub fn new() -> Self {
        Self {
            node_state: NodeState::New,
            has_mixed_audio: false,
            in_connected: 0,
            mixed_in: empty_ports(),
            mixed_out: empty_ports(),
            voice_in: empty_ports(),
            voice_out: empty_ports(),
        }
    }

    /// Mark one receive port as having at least one incoming connection.
    pub fn set_in_connected(&mut self, port: usize) {
        debug_assert!(port < DEVICE_PORTS_MAX);
        self.in_connected |= 1 << port;
    }

    pub fn is_in_connected(&self, port: usize) -> bool {
        port < DEVICE_PORTS_MAX && (self.in_connected >> port) & 1 == 1
    }

    pub fn clear_in_connected(&mut self) {
        self.in_connected = 0;
    }

    /// Allocate the mixed buffers of one receive port on demand.
    pub fn ensure_mixed_in(&mut self, port: usize, buffer_size: usize) {
        ensure_buffer(&mut self.mixed_in, port, buffer_size);
    }

    pub fn ensure_mixed_out(&mut self, port: usize, buffer_size: usize) {
        ensure_buffer(&mut self.mixed_out, port, buffer_size);
    }

    pub fn ensure_voice_in(&mut self, port: usize, buffer_size: usize) {
        ensure_buffer(&mut self.voice_in, port, buffer_size);
    }

    pub fn ensure_voice_out(&mut self, port: usize, buffer_size: usize) {
        ensure_buffer(&mut self.voice_out, port, buffer_size);
    }

    pub fn mixed_in(&self, port: usize) -> Option<&WorkBuffer> {
        self.mixed_in.get(port).and_then(Option::as_ref)
    }

    pub fn mixed_in_mut(&mut self, port: usize) -> Option<&mut WorkBuffer> {
        self.mixed_in.get_mut(port).and_then(Option::as_mut)
    }

    pub fn mixed_out(&self, port: usize) -> Option<&WorkBuffer> {
        self.mixed_out.get(port).and_then(Option::as_ref)
    }

    pub fn mixed_out_mut(&mut self, port: usize) -> Option<&mut WorkBuffer> {
        self.mixed_out.get_mut(port).and_then(Option::as_mut)
    }

    pub fn voice_in(&self, port: usize) -> Option<&WorkBuffer> {
        self.voice_in.get(port).and_then(Option::as_ref)
    }

    pub fn voice_in_mut(&mut self, port: usize) -> Option<&mut WorkBuffer> {
        self.voice_in.get_mut(port).and_then(Option::as_mut)
    }

    pub fn voice_out(&self, port: usize) -> Option<&WorkBuffer> {
        self.voice_out.get(port).and_then(Option::as_ref)
    }

    pub fn voice_out_mut(&mut self, port: usize) -> Option<&mut WorkBuffer> {
        self.voice_out.get_mut(port).and_then(Option::as_mut)
    }

    /// Split borrows for processors that read voice receive buffers while
    /// writing voice send buffers.
    pub fn voice_bufs_mut(
        &mut self,
    ) -> (&[Option<WorkBuffer>], &mut [Option<WorkBuffer>]) {
        (&self.voice_in, &mut self.voice_out)
    }

    /// Split borrows for the mixed path.
    pub fn mixed_bufs_mut(
        &mut self,
    ) -> (&[Option<WorkBuffer>], &mut [Option<WorkBuffer>]) {
        (&self.mixed_in, &mut self.mixed_out)
    }

    /// Invalidate all mixed buffers for a new slice and reset the walk
    /// color. Consumers treat invalid buffers as silence, so no samples
    /// need to be written here.
    pub fn clear_mixed_buffers(&mut self) {
        for buf in self.mixed_in.iter_mut().chain(self.mixed_out.iter_mut()) {
            if let Some(b) = buf {
                b.invalidate();
            }
        }
        self.has_mixed_audio = false;
        self.node_state = NodeState::New;
    }

    /// Invalidate per-voice buffers before rendering one voice group.
    pub fn clear_voice_buffers(&mut self) {
        for buf in self.voice_in.iter_mut().chain(self.voice_out.iter_mut()) {
            if let Some(b) = buf {
                b.invalidate();
            }
        }
    }

    /// Copy one mixed receive buffer straight to the matching send buffer,
    /// used by audio-unit bypass.
    pub fn copy_in_to_out(&mut self, port: usize, start: usize, stop: usize) {
        let Some(Some(src)) = self.mixed_in.get(port) else {
            return;
        };
        if !src.is_valid() {
            return;
        }
        // The in and out banks are distinct fields, so the split borrow is
        // expressed by taking them apart explicitly.
        let (ins, outs) = (&self.mixed_in, &mut self.mixed_out);
        if let (Some(Some(src)), Some(Some(dest))) = (ins.get(port), outs.get_mut(port)) {
            dest.copy_from(src, start, stop);
        }
    }

    /// Accumulate completed per-voice send buffers into the matching mixed
    /// send buffers of this thread.
    pub fn mix_voice_signals(&mut self, start: usize, stop: usize) {
        for port in 0..DEVICE_PORTS_MAX {
            let Some(voice_buf) = self.voice_out.get(port).and_then(Option::as_ref) else {
                continue;
            };
            if !voice_buf.is_valid() {
                continue;
            }
            if let Some(Some(mixed_buf)) = self.mixed_out.get_mut(port) {
                mixed_buf.mix(voice_buf, start, stop);
                self.has_mixed_audio = true;
            }
        }
    }

    /// Resize every allocated buffer, discarding contents.
    pub fn set_buffer_size(&mut self, buffer_size: usize) {
        for buf in self
            .mixed_in
            .iter_mut()
            .chain(self.mixed_out.iter_mut())
            .chain(self.voice_in.iter_mut())
            .chain(self.voice_out.iter_mut())
            .flatten()
        {
            buf.resize(buffer_size);
        }
    }
}

fn empty_ports() -> Vec<Option<WorkBuffer>> {
    (0..DEVICE_PORTS_MAX).map(|_| None).collect()
}

fn ensure_buffer(bufs: &mut [Option<WorkBuffer>], port: usize, buffer_size: usize) {
    debug_assert!(port < DEVICE_PORTS_MAX);
    if bufs[port].is_none() {
        bufs[port] = Some(WorkBuffer::new(buffer_size));
    }
}

/// One render thread's scratch for every device.
#[derive(Debug, Default)]
pub struct ThreadStateSet {
    states: Vec<DeviceThreadState>,
}

impl ThreadStateSet {
    pub fn new(device_count: usize) -> Self {
        Self {
            states: (0..device_count).map(|_| DeviceThreadState::new()).collect(),
        }
    }

    pub fn get(&self, id: DeviceId) -> &DeviceThreadState {
        &self.states[id]
    }

    pub fn get_mut(&mut self, id: DeviceId) -> &mut DeviceThreadState {
        &mut self.states[id]
    }

    /// Distinct mutable references to two devices' thread states, used when
    /// mixing a sender's output into a receiver's input.
    pub fn get_pair_mut(
        &mut self,
        a: DeviceId,
        b: DeviceId,
    ) -> (&mut DeviceThreadState, &mut DeviceThreadState) {
        debug_assert!(a != b);
        if a < b {
            let (lo, hi) = self.states.split_at_mut(b);
            (&mut lo[a], &mut hi[0])
        } else {
            let (lo, hi) = self.states.split_at_mut(a);
            (&mut hi[0], &mut lo[b])
        }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut DeviceThreadState> {
        self.states.iter_mut()
    }
}

/// The full runtime state collection: one device state per device, one
/// thread state set per render thread.
#[derive(Debug, Default)]
pub struct DeviceStates {
    states: Vec<DeviceState>,
    threads: Vec<ThreadStateSet>,
}

impl DeviceStates {
    pub fn new(device_count: usize, thread_count: usize) -> Self {
        debug_assert!(thread_count >= 1);
        Self {
            states: (0..device_count).map(|_| DeviceState::new()).collect(),
            threads: (0..thread_count)
                .map(|_| ThreadStateSet::new(device_count))
                .collect(),
        }
    }

    pub fn device_count(&self) -> usize {
        self.states.len()
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    pub fn state(&self, id: DeviceId) -> &DeviceState {
        &self.states[id]
    }

    pub fn state_mut(&mut self, id: DeviceId) -> &mut DeviceState {
        &mut self.states[id]
    }

    pub fn thread(&self, index: usize) -> &ThreadStateSet {
        &self.threads[index]
    }

    pub fn thread_mut(&mut self, index: usize) -> &mut ThreadStateSet {
        &mut self.threads[index]
    }

    /// Split into device states and thread state sets for parallel voice
    /// rendering: each worker takes one `ThreadStateSet`, the device states
    /// stay shared read-only.
    pub fn split_for_render(&mut self) -> (&[DeviceState], &mut [ThreadStateSet]) {
        (&self.states, &mut self.threads)
    }

    /// Split one mutable thread state set from the (read-only) device
    /// states, for the single-threaded mixed render pass.
    pub fn split_thread(
        &mut self,
        index: usize,
    ) -> (&mut [DeviceState], &mut ThreadStateSet) {
        (&mut self.states, &mut self.threads[index])
    }

    /// Invalidate all mixed buffers on all threads for a new slice.
    pub fn clear_mixed_buffers(&mut self) {
        for thread in &mut self.threads {
            for tstate in thread.iter_mut() {
                tstate.clear_mixed_buffers();
            }
        }
    }

    /// Merge worker threads' mixed buffers (voice accumulations) into
    /// thread 0 before the mixed render pass.
    pub fn merge_thread_signals(&mut self, start: usize, stop: usize) {
        if self.threads.len() < 2 {
            return;
        }
        let (main, rest) = self.threads.split_at_mut(1);
        let main = &mut main[0];
        for other in rest {
            for id in 0..main.len() {
                let src = other.get(id);
                if !src.has_mixed_audio {
                    continue;
                }
                let dest = main.get_mut(id);
                for port in 0..DEVICE_PORTS_MAX {
                    if let Some(src_buf) = src.mixed_out(port) {
                        if !src_buf.is_valid() {
                            continue;
                        }
                        dest.ensure_mixed_out(port, src_buf.len());
                        if let Some(dest_buf) = dest.mixed_out_mut(port) {
                            dest_buf.mix(src_buf, start, stop);
                        }
                        dest.has_mixed_audio = true;
                    }
                }
            }
        }
    }

    /// Change the render thread count, preserving device states.
    pub fn set_thread_count(&mut self, thread_count: usize) {
        debug_assert!(thread_count >= 1);
        let device_count = self.states.len();
        self.threads
            .resize_with(thread_count, || ThreadStateSet::new(device_count));
    }

    /// Resize every allocated buffer on every thread.
    pub fn set_buffer_size(&mut self, buffer_size: usize) {
        for thread in &mut self.threads {
            for tstate in thread.iter_mut() {
                tstate.set_buffer_size(buffer_size);
            }
        }
    }
}
