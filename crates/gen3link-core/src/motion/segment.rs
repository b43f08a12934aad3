//! Move segmentation
//!
//! The stage queues relative moves whose per-axis step counts fit in 16
//! bits. Longer moves are split into consecutive segments that share one
//! step rate, so the machine traces the same straight line.

use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use super::{
    timer::{quantize, TimerSetting, TICKS_PER_MINUTE},
    Point3,
};
use crate::protocol::{PacketBuilder, StageCommand, Target};

/// Most steps any axis may take in one queued segment
pub const MAX_SEGMENT_STEPS: u32 = 65535;

/// One queued relative move
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotionSegment {
    /// Signed step delta per axis
    pub steps: [i32; 3],
    /// Clock ticks between steps of the fastest axis
    pub ticks: u64,
    /// Quantized form of `ticks`
    pub timer: TimerSetting,
}

impl MotionSegment {
    /// Steps of the axis that moves furthest
    pub fn master_steps(&self) -> u32 {
        self.steps.iter().map(|s| s.unsigned_abs()).max().unwrap_or(0)
    }

    /// QUEUE_POINT_RELATIVE request for this segment
    pub fn packet(&self) -> PacketBuilder {
        PacketBuilder::new(Target::Stage, StageCommand::QueuePointRelative.code())
            .add_i32(self.steps[0])
            .add_i32(self.steps[1])
            .add_i32(self.steps[2])
            .add8(self.timer.band)
            .add16(self.timer.counter)
    }
}

/// Feedrate (mm/min) that keeps every axis within its limit.
///
/// A non-positive request falls back to the fastest axis limit.
pub fn safe_feedrate(current: &Point3, target: &Point3, requested: f64, max_feedrate: &Point3) -> f64 {
    let mut feedrate = requested;
    if feedrate.is_nan() || feedrate <= 0.0 {
        feedrate = max_feedrate.max_component().max(1.0);
        warn!("zero feedrate requested, using {} mm/min", feedrate);
    }

    let length = current.distance(target);
    if length == 0.0 {
        return feedrate;
    }
    let delta = [
        (target.x - current.x).abs(),
        (target.y - current.y).abs(),
        (target.z - current.z).abs(),
    ];
    for (d, limit) in delta.into_iter().zip(max_feedrate.to_array()) {
        if d > 0.0 && feedrate * d / length > limit {
            feedrate = limit * length / d;
        }
    }
    feedrate
}

/// Clock ticks between master-axis steps for a move of `distance_mm`
/// covered in `master_steps` steps at `feedrate` mm/min
pub fn ticks_per_step(distance_mm: f64, feedrate: f64, master_steps: u64) -> u64 {
    if master_steps == 0 {
        return 0;
    }
    // float to int casts saturate, so a zero feedrate lands on the slowest timer
    (distance_mm * TICKS_PER_MINUTE as f64 / feedrate / master_steps as f64).floor() as u64
}

/// Split a step delta into segments of at most [`MAX_SEGMENT_STEPS`] per axis.
///
/// Every segment but the last moves the master axis exactly the maximum;
/// other axes get their share of the cumulative progress, rounded, so the
/// segments add up to `delta` exactly.
pub fn segment_steps(delta: [i64; 3], ticks: u64) -> Vec<MotionSegment> {
    let master = delta.iter().map(|d| d.unsigned_abs()).max().unwrap_or(0);
    if master == 0 {
        return Vec::new();
    }

    let max = u64::from(MAX_SEGMENT_STEPS);
    let count = master.div_ceil(max);
    let timer = quantize(ticks);
    let mut done = [0u64; 3];
    let mut segments = Vec::with_capacity(count as usize);

    for i in 1..=count {
        let progress = (max * i).min(master);
        let mut steps = [0i32; 3];
        for axis in 0..3 {
            let total = delta[axis].unsigned_abs();
            let cumulative = share(total, progress, master);
            let step = (cumulative - done[axis]) as i32;
            done[axis] = cumulative;
            steps[axis] = if delta[axis] < 0 { -step } else { step };
        }
        segments.push(MotionSegment {
            steps,
            ticks,
            timer,
        });
    }
    segments
}

/// round(total * progress / master) without overflow
fn share(total: u64, progress: u64, master: u64) -> u64 {
    let num = u128::from(total) * u128::from(progress);
    let den = u128::from(master);
    ((2 * num + den) / (2 * den)) as u64
}

/// Plan the move from `current` to `target` (both mm) at `feedrate`
/// mm/min. Returns no segments when no axis moves a whole step.
pub fn plan_move(
    current: &Point3,
    target: &Point3,
    feedrate: f64,
    steps_per_mm: &Point3,
) -> Vec<MotionSegment> {
    let from = current.to_steps(steps_per_mm);
    let to = target.to_steps(steps_per_mm);
    let delta = [to[0] - from[0], to[1] - from[1], to[2] - from[2]];
    let master = delta.iter().map(|d| d.unsigned_abs()).max().unwrap_or(0);
    if master == 0 {
        trace!("plan_move: {} -> {} is below one step", current, target);
        return Vec::new();
    }

    let ticks = ticks_per_step(current.distance(target), feedrate, master);
    let segments = segment_steps(delta, ticks);
    trace!(
        "plan_move: {:?} steps, {} ticks/step, {} segment(s)",
        delta,
        ticks,
        segments.len()
    );
    segments
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    const SPM: Point3 = Point3::new(100.0, 100.0, 2000.0);

    #[test]
    fn test_short_move_single_segment() {
        let segs = plan_move(
            &Point3::default(),
            &Point3::new(10.0, -5.0, 0.0),
            600.0,
            &SPM,
        );
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].steps, [1000, -500, 0]);
        // 11.1803 mm at 600 mm/min over 1000 steps
        let expected = (125f64.sqrt() * 960_000_000.0 / 600.0 / 1000.0).floor() as u64;
        assert_eq!(segs[0].ticks, expected);
        assert_eq!(segs[0].timer, quantize(expected));
    }

    #[test]
    fn test_zero_length_move() {
        let p = Point3::new(1.0, 2.0, 3.0);
        assert!(plan_move(&p, &p, 1000.0, &SPM).is_empty());
        // less than half a step
        assert!(plan_move(&p, &Point3::new(1.004, 2.0, 3.0), 1000.0, &SPM).is_empty());
    }

    #[test]
    fn test_long_move_is_split() {
        let segs = segment_steps([150_000, 75_000, -10], 100);
        assert_eq!(segs.len(), 3);
        assert_eq!(segs[0].steps[0], 65535);
        assert_eq!(segs[1].steps[0], 65535);
        assert_eq!(segs[2].steps[0], 150_000 - 2 * 65535);
        let y: i64 = segs.iter().map(|s| i64::from(s.steps[1])).sum();
        let z: i64 = segs.iter().map(|s| i64::from(s.steps[2])).sum();
        assert_eq!(y, 75_000);
        assert_eq!(z, -10);
        assert!(segs.iter().all(|s| s.ticks == 100));
    }

    #[test]
    fn test_exact_multiple() {
        let segs = segment_steps([0, 0, 65535 * 2], 10);
        assert_eq!(segs.len(), 2);
        assert_eq!(segs[0].steps, [0, 0, 65535]);
        assert_eq!(segs[1].steps, [0, 0, 65535]);
    }

    #[test]
    fn test_segment_packet_layout() {
        let seg = MotionSegment {
            steps: [-1, 2, 3],
            ticks: 65536,
            timer: quantize(65536),
        };
        let bytes = seg.packet().build().unwrap();
        assert_eq!(bytes[3], 128);
        assert_eq!(&bytes[4..8], &(-1i32).to_le_bytes());
        assert_eq!(bytes[16], 1);
        assert_eq!(&bytes[17..19], &8192u16.to_le_bytes());
    }

    #[test]
    fn test_safe_feedrate_limits_axis() {
        let max = Point3::new(5000.0, 5000.0, 150.0);
        let origin = Point3::default();
        // pure Z move at 1000 mm/min is capped to the Z limit
        let f = safe_feedrate(&origin, &Point3::new(0.0, 0.0, 10.0), 1000.0, &max);
        assert!((f - 150.0).abs() < 1e-9);
        // XY move within limits is untouched
        let f = safe_feedrate(&origin, &Point3::new(10.0, 10.0, 0.0), 3000.0, &max);
        assert!((f - 3000.0).abs() < 1e-9);
    }

    #[test]
    fn test_safe_feedrate_zero_uses_fastest_axis() {
        let max = Point3::new(5000.0, 4000.0, 150.0);
        let f = safe_feedrate(
            &Point3::default(),
            &Point3::new(10.0, 0.0, 0.0),
            0.0,
            &max,
        );
        assert!((f - 5000.0).abs() < 1e-9);
        let f = safe_feedrate(&Point3::default(), &Point3::default(), -1.0, &Point3::default());
        assert!((f - 1.0).abs() < 1e-9);
    }

    proptest! {
        #[test]
        fn segments_are_lossless(
            dx in -500_000i64..500_000,
            dy in -500_000i64..500_000,
            dz in -500_000i64..500_000,
        ) {
            let delta = [dx, dy, dz];
            let segs = segment_steps(delta, 1000);
            let master = delta.iter().map(|d| d.unsigned_abs()).max().unwrap();
            prop_assert_eq!(segs.len() as u64, master.div_ceil(65535));
            for axis in 0..3 {
                let sum: i64 = segs.iter().map(|s| i64::from(s.steps[axis])).sum();
                prop_assert_eq!(sum, delta[axis]);
            }
            for s in &segs {
                prop_assert!(s.master_steps() <= MAX_SEGMENT_STEPS);
            }
        }

        #[test]
        fn segment_signs_follow_delta(d in 1i64..400_000) {
            for s in segment_steps([-d, d, 0], 1) {
                prop_assert!(s.steps[0] <= 0);
                prop_assert!(s.steps[1] >= 0);
                prop_assert_eq!(s.steps[0], -s.steps[1]);
            }
        }
    }
}
