//! Parameter Automation
//!
//! Continuous parameters (force, pitch, panning, named streams) are driven
//! sample-accurately by three cooperating value types:
//!
//! - [`Slider`]: a linear ramp from the current value to a target over a
//!   musical length, stepped once per frame,
//! - [`Lfo`]: a sine oscillator whose speed and depth have linear slides of
//!   their own,
//! - [`LinearControls`]: the composition used everywhere: a base value,
//!   a slider, an LFO and a clamp range, able to fill a whole work buffer
//!   for a render slice in one call.
//!
//! Each type can estimate how many steps remain before its next regime
//! change, which lets the buffer fill run in vectorizable segments and keep
//! the constant-region marker of the destination buffer accurate.

use crate::tstamp::Tstamp;
use crate::work_buffer::WorkBuffer;

use libm::Libm;

/// A sample-accurate linear ramp between two scalar values.
#[derive(Debug, Clone)]
pub struct Slider {
    audio_rate: u32,
    tempo: f64,
    length: Tstamp,
    from: f64,
    to: f64,
    /// Normalized progress in [0, 1].
    progress: f64,
    progress_update: f64,
    in_progress: bool,
}

impl Slider {
    pub fn new() -> Self {
        Self {
            audio_rate: 48000,
            tempo: 120.0,
            length: Tstamp::zero(),
            from: 0.0,
            to: 0.0,
            progress: 1.0,
            progress_update: 1.0,
            in_progress: false,
        }
    }

    pub fn set_audio_rate(&mut self, audio_rate: u32) {
        debug_assert!(audio_rate > 0);
        self.audio_rate = audio_rate;
        self.refresh_update();
    }

    pub fn set_tempo(&mut self, tempo: f64) {
        debug_assert!(tempo > 0.0);
        self.tempo = tempo;
        self.refresh_update();
    }

    /// Set the slide length used by subsequent [`Slider::start`] calls.
    pub fn set_length(&mut self, length: &Tstamp) {
        self.length = *length;
        self.refresh_update();
    }

    fn step_count(&self) -> f64 {
        self.length.to_frames(self.tempo, self.audio_rate).max(1.0)
    }

    fn refresh_update(&mut self) {
        self.progress_update = 1.0 / self.step_count();
    }

    /// Begin a slide from `start_value` towards `target`.
    ///
    /// A zero-length slide reaches the target on the first step.
    pub fn start(&mut self, target: f64, start_value: f64) {
        self.from = start_value;
        self.to = target;
        self.progress = 0.0;
        self.progress_update = 1.0 / self.step_count();
        self.in_progress = true;
    }

    /// Retarget a slide in progress.
    ///
    /// The current value is preserved; the slide restarts from it towards
    /// the new target over the configured length.
    pub fn change_target(&mut self, target: f64) {
        let cur = self.value();
        self.start(target, cur);
    }

    /// Freeze the slider at its current value.
    pub fn break_slide(&mut self) {
        self.in_progress = false;
    }

    /// Whether a slide is in progress.
    #[inline]
    pub fn in_progress(&self) -> bool {
        self.in_progress
    }

    /// The current value of the slide.
    #[inline]
    pub fn value(&self) -> f64 {
        if self.progress >= 1.0 {
            self.to
        } else {
            self.from + (self.to - self.from) * self.progress
        }
    }

    /// Advance one step and return the new value.
    #[inline]
    pub fn step(&mut self) -> f64 {
        if !self.in_progress {
            return self.to;
        }
        self.progress += self.progress_update;
        if self.progress >= 1.0 {
            self.progress = 1.0;
            self.in_progress = false;
        }
        self.value()
    }

    /// Advance multiple steps at once and return the new value.
    pub fn skip(&mut self, step_count: u64) -> f64 {
        if self.in_progress {
            self.progress += self.progress_update * step_count as f64;
            if self.progress >= 1.0 {
                self.progress = 1.0;
                self.in_progress = false;
            }
        }
        self.value()
    }

    /// Number of steps before the slide completes, for segmented fills.
    /// Returns 0 when no slide is in progress.
    pub fn estimate_active_steps_left(&self) -> usize {
        if !self.in_progress {
            return 0;
        }
        let left = (1.0 - self.progress) / self.progress_update;
        (left.ceil() as usize).max(1)
    }

    /// Remap the slide endpoints affinely from one value range to another.
    pub fn change_range(
        &mut self,
        range_min: f64,
        range_max: f64,
        map_min_to: f64,
        map_max_to: f64,
    ) {
        self.from = remap(self.from, range_min, range_max, map_min_to, map_max_to);
        self.to = remap(self.to, range_min, range_max, map_min_to, map_max_to);
    }
}

impl Default for Slider {
    fn default() -> Self {
        Self::new()
    }
}

fn remap(value: f64, from_min: f64, from_max: f64, to_min: f64, to_max: f64) -> f64 {
    let width = from_max - from_min;
    let norm = if width != 0.0 {
        (value - from_min) / width
    } else {
        0.0
    };
    to_min + (to_max - to_min) * norm
}

/// How an LFO contribution combines with its base value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LfoMode {
    /// The oscillation is added to the base value.
    Linear,
    /// The oscillation multiplies the base value.
    Exponential,
}

/// A sine oscillator with slides on its speed and depth.
///
/// Starts at zero phase so that turning the oscillation on never produces a
/// discontinuity.
#[derive(Debug, Clone)]
pub struct Lfo {
    mode: LfoMode,
    audio_rate: u32,
    tempo: f64,
    on: bool,
    speed: f64,
    depth: f64,
    speed_slider: Slider,
    depth_slider: Slider,
    phase: f64,
}

impl Lfo {
    pub fn new(mode: LfoMode) -> Self {
        Self {
            mode,
            audio_rate: 48000,
            tempo: 120.0,
            on: false,
            speed: 0.0,
            depth: 0.0,
            speed_slider: Slider::new(),
            depth_slider: Slider::new(),
            phase: 0.0,
        }
    }

    pub fn mode(&self) -> LfoMode {
        self.mode
    }

    pub fn set_audio_rate(&mut self, audio_rate: u32) {
        self.audio_rate = audio_rate;
        self.speed_slider.set_audio_rate(audio_rate);
        self.depth_slider.set_audio_rate(audio_rate);
    }

    pub fn set_tempo(&mut self, tempo: f64) {
        self.tempo = tempo;
        self.speed_slider.set_tempo(tempo);
        self.depth_slider.set_tempo(tempo);
    }

    /// Set the oscillation speed in Hz, sliding over the configured speed
    /// slide length.
    pub fn set_speed(&mut self, speed: f64) {
        debug_assert!(speed >= 0.0);
        self.speed_slider.start(speed, self.speed);
    }

    /// Set the length of subsequent speed slides.
    pub fn set_speed_slide(&mut self, length: &Tstamp) {
        self.speed_slider.set_length(length);
    }

    /// Set the oscillation depth, sliding over the configured depth slide
    /// length.
    pub fn set_depth(&mut self, depth: f64) {
        self.depth_slider.start(depth, self.depth);
    }

    /// Set the length of subsequent depth slides.
    pub fn set_depth_slide(&mut self, length: &Tstamp) {
        self.depth_slider.set_length(length);
    }

    /// Enable the oscillation. The phase always starts from zero.
    pub fn turn_on(&mut self) {
        if !self.on {
            self.phase = 0.0;
        }
        self.on = true;
    }

    pub fn turn_off(&mut self) {
        self.on = false;
    }

    /// Whether stepping the LFO currently produces a changing value.
    pub fn is_active(&self) -> bool {
        self.on && (self.depth != 0.0 || self.depth_slider.in_progress())
    }

    /// Number of steps before the contribution becomes constant.
    /// `usize::MAX` while oscillating with nonzero depth.
    pub fn estimate_active_steps_left(&self) -> usize {
        if !self.on {
            return 0;
        }
        if self.depth != 0.0 {
            return usize::MAX;
        }
        self.depth_slider.estimate_active_steps_left()
    }

    /// Advance one step and return the oscillation contribution.
    #[inline]
    pub fn step(&mut self) -> f64 {
        if !self.on {
            return self.neutral();
        }

        if self.speed_slider.in_progress() {
            self.speed = self.speed_slider.step();
        }
        if self.depth_slider.in_progress() {
            self.depth = self.depth_slider.step();
        }

        let value = Libm::<f64>::sin(self.phase * core::f64::consts::TAU) * self.depth;

        self.phase += self.speed / f64::from(self.audio_rate);
        if self.phase >= 1.0 {
            self.phase -= Libm::<f64>::floor(self.phase);
        }

        match self.mode {
            LfoMode::Linear => value,
            LfoMode::Exponential => Libm::<f64>::exp2(value),
        }
    }

    /// Advance multiple steps without producing values.
    pub fn skip(&mut self, step_count: u64) {
        self.speed = self.speed_slider.skip(step_count);
        self.depth = self.depth_slider.skip(step_count);
        if self.on {
            self.phase += self.speed * step_count as f64 / f64::from(self.audio_rate);
            self.phase -= Libm::<f64>::floor(self.phase);
        }
    }

    /// Rescale the depth (and any depth slide) when the surrounding value
    /// range is retargeted.
    pub fn change_depth_range(&mut self, src_range_diff: f64, target_range_diff: f64) {
        if src_range_diff == 0.0 {
            return;
        }
        let factor = target_range_diff / src_range_diff;
        self.depth *= factor;
        self.depth_slider.change_range(0.0, 1.0, 0.0, factor);
    }

    fn neutral(&self) -> f64 {
        match self.mode {
            LfoMode::Linear => 0.0,
            LfoMode::Exponential => 1.0,
        }
    }
}

/// Composition of a base value, a slider, an LFO and a clamp range.
///
/// This is the value type embedded in channel state, voice state and master
/// volume control; events only ever mutate one of these.
#[derive(Debug, Clone)]
pub struct LinearControls {
    value: f64,
    min_value: f64,
    max_value: f64,
    slider: Slider,
    lfo: Lfo,
}

impl LinearControls {
    pub fn new() -> Self {
        Self {
            value: f64::NAN,
            min_value: f64::NEG_INFINITY,
            max_value: f64::INFINITY,
            slider: Slider::new(),
            lfo: Lfo::new(LfoMode::Linear),
        }
    }

    pub fn set_audio_rate(&mut self, audio_rate: u32) {
        self.slider.set_audio_rate(audio_rate);
        self.lfo.set_audio_rate(audio_rate);
    }

    pub fn set_tempo(&mut self, tempo: f64) {
        self.slider.set_tempo(tempo);
        self.lfo.set_tempo(tempo);
    }

    /// Restrict produced values to `[min_value, max_value]`.
    pub fn set_range(&mut self, min_value: f64, max_value: f64) {
        debug_assert!(!min_value.is_nan());
        debug_assert!(max_value >= min_value);
        self.min_value = min_value;
        self.max_value = max_value;
    }

    /// Set the value directly, breaking any slide in progress.
    pub fn set_value(&mut self, value: f64) {
        debug_assert!(value.is_finite());
        self.value = value;
        self.slider.break_slide();
    }

    /// The current clamped value.
    pub fn value(&self) -> f64 {
        self.value.clamp(self.min_value, self.max_value)
    }

    /// Whether a value has ever been set.
    pub fn has_value(&self) -> bool {
        !self.value.is_nan()
    }

    /// Slide towards `target`, retargeting if a slide is in progress.
    pub fn slide_target(&mut self, target: f64) {
        debug_assert!(target.is_finite());
        if self.slider.in_progress() {
            self.slider.change_target(target);
        } else {
            self.slider.start(target, self.value);
        }
    }

    /// Set the length of subsequent value slides.
    pub fn slide_length(&mut self, length: &Tstamp) {
        self.slider.set_length(length);
    }

    /// Set oscillation speed in Hz and enable the LFO.
    pub fn osc_speed(&mut self, speed: f64) {
        debug_assert!(speed >= 0.0);
        self.lfo.set_speed(speed);
        self.lfo.turn_on();
    }

    /// Set oscillation depth and enable the LFO.
    pub fn osc_depth(&mut self, depth: f64) {
        debug_assert!(depth.is_finite());
        self.lfo.set_depth(depth);
        self.lfo.turn_on();
    }

    /// Set the length of subsequent oscillation speed slides.
    pub fn osc_speed_slide(&mut self, length: &Tstamp) {
        self.lfo.set_speed_slide(length);
    }

    /// Set the length of subsequent oscillation depth slides.
    pub fn osc_depth_slide(&mut self, length: &Tstamp) {
        self.lfo.set_depth_slide(length);
    }

    /// Whether the produced stream is currently changing over time.
    pub fn is_active(&self) -> bool {
        self.slider.in_progress() || self.lfo.is_active()
    }

    /// Produce a sample-accurate value stream into `[start, stop)` of the
    /// work buffer.
    ///
    /// The destination's constant-start marker is set to the first index
    /// after which both the slider and the LFO are inactive, so downstream
    /// consumers can short-circuit on the constant tail.
    pub fn fill_work_buffer(&mut self, wb: &mut WorkBuffer, start: usize, stop: usize) {
        debug_assert!(start < stop);
        debug_assert!(stop <= wb.len());

        let mut const_start = start;

        // Apply slider
        {
            let values = wb.contents_mut();
            let mut cur_pos = start;
            while cur_pos < stop {
                let estimated_steps = self.slider.estimate_active_steps_left();
                if estimated_steps > 0 {
                    let slide_stop = stop.min(cur_pos + estimated_steps);

                    let mut new_value = self.value;
                    for v in values.iter_mut().take(slide_stop).skip(cur_pos) {
                        new_value = self.slider.step();
                        *v = new_value as f32;
                    }
                    self.value = new_value;

                    const_start = slide_stop;
                    cur_pos = slide_stop;
                } else {
                    let value = self.value as f32;
                    for v in values.iter_mut().take(stop).skip(cur_pos) {
                        *v = value;
                    }
                    cur_pos = stop;
                }
            }
        }

        // Apply LFO
        {
            let mut cur_pos = start;
            let mut final_lfo_stop = start;
            while cur_pos < stop {
                let estimated_steps = self.lfo.estimate_active_steps_left();
                if estimated_steps > 0 {
                    let lfo_stop = if estimated_steps < stop - cur_pos {
                        cur_pos + estimated_steps
                    } else {
                        stop
                    };

                    let values = wb.contents_mut();
                    for v in values.iter_mut().take(lfo_stop).skip(cur_pos) {
                        *v += self.lfo.step() as f32;
                    }

                    final_lfo_stop = lfo_stop;
                    cur_pos = lfo_stop;
                } else {
                    final_lfo_stop = cur_pos;
                    break;
                }
            }

            const_start = const_start.max(final_lfo_stop);
        }

        // Clamp values in place
        if self.min_value > f64::NEG_INFINITY {
            let min_value = self.min_value as f32;
            let values = wb.contents_mut();
            for v in values.iter_mut().take(stop).skip(start) {
                *v = v.max(min_value);
            }
        }
        if self.max_value < f64::INFINITY {
            let max_value = self.max_value as f32;
            let values = wb.contents_mut();
            for v in values.iter_mut().take(stop).skip(start) {
                *v = v.min(max_value);
            }
        }

        wb.set_const_start(const_start);
        wb.mark_valid();
    }

    /// Fast-forward the controls without producing output.
    pub fn skip(&mut self, step_count: u64) {
        if self.slider.in_progress() {
            self.value = self.slider.skip(step_count);
        }
        self.lfo.skip(step_count);
    }

    /// Affinely retarget a controls stream to a new value range.
    ///
    /// The base value, slider endpoints, LFO depth and clamp bounds are all
    /// remapped; a flipped source or destination range inverts direction.
    pub fn convert(
        map_min_to: f64,
        map_max_to: f64,
        src: &LinearControls,
        range_min: f64,
        range_max: f64,
    ) -> LinearControls {
        debug_assert!(map_min_to.is_finite());
        debug_assert!(map_max_to.is_finite());
        debug_assert!(range_min.is_finite());
        debug_assert!(range_max.is_finite());

        let mut dest = src.clone();

        dest.value = remap(src.value, range_min, range_max, map_min_to, map_max_to);
        dest.slider
            .change_range(range_min, range_max, map_min_to, map_max_to);
        dest.lfo
            .change_depth_range(range_max - range_min, map_max_to - map_min_to);

        // Convert the clamp bounds, swapping them when direction inverts.
        let flip = (range_min <= range_max) != (map_min_to <= map_max_to);

        let src_lo = range_min.min(range_max);
        let src_hi = range_min.max(range_max);
        let src_width = src_hi - src_lo;

        let mut new_min = if flip { src.max_value } else { src.min_value };
        let mut new_max = if flip { src.min_value } else { src.max_value };

        for bound in [&mut new_min, &mut new_max] {
            if bound.is_finite() {
                let mut norm = if src_width > 0.0 {
                    (*bound - src_lo) / src_width
                } else {
                    0.0
                };
                if range_min > range_max {
                    norm = 1.0 - norm;
                }
                *bound = map_min_to + (map_max_to - map_min_to) * norm;
            } else if flip {
                *bound = -*bound;
            }
        }

        debug_assert!(new_min <= new_max);
        dest.min_value = new_min;
        dest.max_value = new_max;

        dest
    }
}

impl Default for LinearControls {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn slider_at(rate: u32, tempo: f64, length: Tstamp) -> Slider {
        let mut s = Slider::new();
        s.set_audio_rate(rate);
        s.set_tempo(tempo);
        s.set_length(&length);
        s
    }

    #[test]
    fn test_slider_reaches_target() {
        // One beat at 120 BPM, 8 Hz audio rate = 4 steps.
        let mut s = slider_at(8, 120.0, Tstamp::new(1, 0));
        s.start(4.0, 0.0);

        assert_relative_eq!(s.step(), 1.0);
        assert_relative_eq!(s.step(), 2.0);
        assert_relative_eq!(s.step(), 3.0);
        assert_relative_eq!(s.step(), 4.0);
        assert!(!s.in_progress());
        assert_relative_eq!(s.step(), 4.0);
    }

    #[test]
    fn test_zero_length_slider_jumps_in_one_step() {
        let mut s = slider_at(48000, 120.0, Tstamp::zero());
        s.start(1.0, 0.0);
        assert_relative_eq!(s.step(), 1.0);
        assert!(!s.in_progress());
    }

    #[test]
    fn test_slider_change_target_preserves_position() {
        let mut s = slider_at(8, 120.0, Tstamp::new(1, 0));
        s.start(4.0, 0.0);
        s.step();
        s.step();
        assert_relative_eq!(s.value(), 2.0);

        s.change_target(2.0);
        // Already at the new target: the slide stays flat.
        assert_relative_eq!(s.step(), 2.0);
        assert_relative_eq!(s.step(), 2.0);
    }

    #[test]
    fn test_slider_break_freezes_value() {
        let mut s = slider_at(8, 120.0, Tstamp::new(1, 0));
        s.start(4.0, 0.0);
        s.step();
        s.break_slide();
        assert!(!s.in_progress());
    }

    #[test]
    fn test_slider_estimate_matches_steps() {
        let mut s = slider_at(8, 120.0, Tstamp::new(1, 0));
        s.start(4.0, 0.0);
        assert_eq!(s.estimate_active_steps_left(), 4);
        s.step();
        assert_eq!(s.estimate_active_steps_left(), 3);
    }

    #[test]
    fn test_slider_skip() {
        let mut s = slider_at(8, 120.0, Tstamp::new(1, 0));
        s.start(4.0, 0.0);
        assert_relative_eq!(s.skip(2), 2.0);
        assert_relative_eq!(s.skip(100), 4.0);
    }

    #[test]
    fn test_lfo_zero_phase_start() {
        let mut lfo = Lfo::new(LfoMode::Linear);
        lfo.set_audio_rate(100);
        lfo.set_speed(10.0);
        lfo.set_depth(1.0);
        lfo.turn_on();
        // First step is sin(0) scaled by the (possibly sliding) depth.
        assert_relative_eq!(lfo.step(), 0.0);
    }

    #[test]
    fn test_lfo_inactive_is_neutral() {
        let mut lfo = Lfo::new(LfoMode::Linear);
        assert_relative_eq!(lfo.step(), 0.0);
        let mut exp = Lfo::new(LfoMode::Exponential);
        assert_relative_eq!(exp.step(), 1.0);
    }

    #[test]
    fn test_controls_fill_constant() {
        let mut lc = LinearControls::new();
        lc.set_audio_rate(8);
        lc.set_tempo(120.0);
        lc.set_value(3.0);

        let mut wb = WorkBuffer::new(16);
        lc.fill_work_buffer(&mut wb, 0, 16);

        assert!(wb.is_valid());
        assert_eq!(wb.const_start(), Some(0));
        assert!(wb.contents()[..16].iter().all(|&x| x == 3.0));
    }

    #[test]
    fn test_controls_fill_slide_sets_const_start() {
        let mut lc = LinearControls::new();
        lc.set_audio_rate(8);
        lc.set_tempo(120.0);
        lc.set_value(0.0);
        lc.slide_length(&Tstamp::new(1, 0)); // 4 steps
        lc.slide_target(4.0);

        let mut wb = WorkBuffer::new(16);
        lc.fill_work_buffer(&mut wb, 0, 16);

        // Slide occupies the first 4 frames, constant afterwards.
        assert_eq!(wb.const_start(), Some(4));
        assert_relative_eq!(wb.contents()[0], 1.0);
        assert_relative_eq!(wb.contents()[3], 4.0);
        assert_relative_eq!(wb.contents()[15], 4.0);
    }

    #[test]
    fn test_controls_clamp() {
        let mut lc = LinearControls::new();
        lc.set_audio_rate(8);
        lc.set_tempo(120.0);
        lc.set_range(-1.0, 1.0);
        lc.set_value(5.0);

        let mut wb = WorkBuffer::new(8);
        lc.fill_work_buffer(&mut wb, 0, 8);
        assert!(wb.contents()[..8].iter().all(|&x| x == 1.0));
        assert_relative_eq!(lc.value(), 1.0);
    }

    #[test]
    fn test_controls_lfo_defeats_const_region() {
        let mut lc = LinearControls::new();
        lc.set_audio_rate(100);
        lc.set_tempo(120.0);
        lc.set_value(0.0);
        lc.osc_speed(10.0);
        lc.osc_depth(1.0);

        let mut wb = WorkBuffer::new(32);
        lc.fill_work_buffer(&mut wb, 0, 32);
        assert_eq!(wb.const_start(), Some(32));
    }

    #[test]
    fn test_convert_remaps_value_and_bounds() {
        let mut src = LinearControls::new();
        src.set_audio_rate(8);
        src.set_tempo(120.0);
        src.set_range(0.0, 1.0);
        src.set_value(0.25);

        let dest = LinearControls::convert(0.0, 100.0, &src, 0.0, 1.0);
        assert_relative_eq!(dest.value(), 25.0);
    }

    #[test]
    fn test_convert_flipped_range() {
        let mut src = LinearControls::new();
        src.set_audio_rate(8);
        src.set_tempo(120.0);
        src.set_range(0.0, 1.0);
        src.set_value(0.25);

        // Mapping [0, 1] onto [100, 0] inverts direction.
        let dest = LinearControls::convert(100.0, 0.0, &src, 0.0, 1.0);
        assert_relative_eq!(dest.value(), 75.0);
    }

    #[test]
    fn test_controls_skip_advances_slide() {
        let mut lc = LinearControls::new();
        lc.set_audio_rate(8);
        lc.set_tempo(120.0);
        lc.set_value(0.0);
        lc.slide_length(&Tstamp::new(1, 0));
        lc.slide_target(4.0);

        lc.skip(2);
        assert_relative_eq!(lc.value(), 2.0);
    }
}
