//! Remote-state buffering for smooth rendering of bodies another peer simulates.
//!
//! Each remote entity keeps a small time-ordered buffer of snapshots. The consumer samples it at
//! `now - interpolation_delay`, so there is normally a bracketing pair to interpolate between.
//! Past the newest sample the last two are extrapolated, bounded to 50% overshoot.

use std::collections::{HashMap, HashSet, VecDeque};

use bevy::prelude::*;

use crate::config::INTERPOLATION_BUFFER_CAPACITY;

/// Max extrapolation factor past the newest sample.
pub const MAX_EXTRAPOLATION: f32 = 1.5;
/// Dot product above which slerp falls back to a normalized lerp.
const SLERP_LINEAR_THRESHOLD: f32 = 0.9995;
/// Lower bound on the interpolation delay (ms).
pub const MIN_INTERPOLATION_DELAY_MS: f64 = 50.0;

/// One timestamped snapshot of a remote body.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RemoteState {
    pub position: Vec3,
    pub rotation: Quat,
    pub velocity: Vec3,
    pub angular_velocity: Vec3,
    pub grounded: bool,
    /// Milliseconds on the sender's clock.
    pub timestamp: f64,
}

impl RemoteState {
    pub fn at(position: Vec3, timestamp: f64) -> Self {
        Self {
            position,
            rotation: Quat::IDENTITY,
            velocity: Vec3::ZERO,
            angular_velocity: Vec3::ZERO,
            grounded: false,
            timestamp,
        }
    }

    /// Blend toward `other`. `t` outside [0, 1] extrapolates.
    pub fn blend(&self, other: &RemoteState, t: f32) -> RemoteState {
        RemoteState {
            position: self.position.lerp(other.position, t),
            rotation: slerp_shortest(self.rotation, other.rotation, t),
            velocity: self.velocity.lerp(other.velocity, t),
            angular_velocity: self.angular_velocity.lerp(other.angular_velocity, t),
            grounded: if t < 0.5 { self.grounded } else { other.grounded },
            timestamp: self.timestamp + (other.timestamp - self.timestamp) * t as f64,
        }
    }
}

/// Spherical interpolation along the shorter arc, with a lerp fallback for nearly equal inputs.
pub fn slerp_shortest(a: Quat, b: Quat, t: f32) -> Quat {
    let mut b = b;
    let mut dot = a.dot(b);
    if dot < 0.0 {
        b = -b;
        dot = -dot;
    }
    if dot > SLERP_LINEAR_THRESHOLD {
        return (a * (1.0 - t) + b * t).normalize();
    }
    let theta_0 = dot.min(1.0).acos();
    let theta = theta_0 * t;
    let sin_0 = theta_0.sin();
    let s0 = (theta_0 - theta).sin() / sin_0;
    let s1 = theta.sin() / sin_0;
    (a * s0 + b * s1).normalize()
}

/// Render delay for a given broadcast rate (Hz): two broadcast periods, at least 50 ms.
pub fn interpolation_delay_ms(broadcast_rate: f64) -> f64 {
    if broadcast_rate <= 0.0 || !broadcast_rate.is_finite() {
        return MIN_INTERPOLATION_DELAY_MS;
    }
    (2000.0 / broadcast_rate).max(MIN_INTERPOLATION_DELAY_MS)
}

/// Bounded, time-ordered snapshot buffer for one entity.
#[derive(Debug, Clone)]
pub struct InterpolationBuffer {
    states: VecDeque<RemoteState>,
    capacity: usize,
}

impl Default for InterpolationBuffer {
    fn default() -> Self {
        Self::new(INTERPOLATION_BUFFER_CAPACITY)
    }
}

impl InterpolationBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            states: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Insert a snapshot in timestamp order. An equal timestamp replaces the stored one.
    /// When full, the oldest snapshot is dropped.
    pub fn add_state(&mut self, state: RemoteState) {
        if !state.timestamp.is_finite() {
            return;
        }
        let newest = self.states.back().map(|s| s.timestamp);
        match newest {
            Some(t) if state.timestamp < t => {
                let idx = self.states.partition_point(|s| s.timestamp < state.timestamp);
                if self.states.get(idx).is_some_and(|s| s.timestamp == state.timestamp) {
                    self.states[idx] = state;
                    return;
                }
                if self.states.len() == self.capacity && idx == 0 {
                    // Older than everything in a full buffer.
                    return;
                }
                self.states.insert(idx, state);
            }
            Some(t) if state.timestamp == t => {
                if let Some(last) = self.states.back_mut() {
                    *last = state;
                }
                return;
            }
            _ => self.states.push_back(state),
        }
        while self.states.len() > self.capacity {
            self.states.pop_front();
        }
    }

    /// State at `render_time` (ms). `None` only when the buffer is empty.
    pub fn get_interpolated_state(&self, render_time: f64) -> Option<RemoteState> {
        let first = self.states.front()?;
        if self.states.len() == 1 {
            return Some(*first);
        }
        if render_time <= first.timestamp {
            return Some(*first);
        }

        let idx = self.states.partition_point(|s| s.timestamp <= render_time);
        if idx < self.states.len() {
            let before = &self.states[idx - 1];
            let after = &self.states[idx];
            let span = after.timestamp - before.timestamp;
            let t = if span > 0.0 {
                ((render_time - before.timestamp) / span) as f32
            } else {
                1.0
            };
            return Some(before.blend(after, t));
        }

        let len = self.states.len();
        let prev = &self.states[len - 2];
        let last = &self.states[len - 1];
        let span = last.timestamp - prev.timestamp;
        if span <= 0.0 {
            return Some(*last);
        }
        let t = (((render_time - prev.timestamp) / span) as f32).min(MAX_EXTRAPOLATION);
        Some(prev.blend(last, t))
    }

    pub fn latest(&self) -> Option<&RemoteState> {
        self.states.back()
    }

    pub fn clear(&mut self) {
        self.states.clear();
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Buffers for every remote entity a peer renders.
///
/// Entities marked local are simulated by this peer and never buffered.
#[derive(Resource, Debug, Clone)]
pub struct RemoteBuffers {
    buffers: HashMap<String, InterpolationBuffer>,
    local: HashSet<String>,
    capacity: usize,
    /// Milliseconds subtracted from "now" before sampling.
    pub delay_ms: f64,
}

impl Default for RemoteBuffers {
    fn default() -> Self {
        Self::new(INTERPOLATION_BUFFER_CAPACITY, interpolation_delay_ms(crate::config::NETWORK_BROADCAST_HZ))
    }
}

impl RemoteBuffers {
    pub fn new(capacity: usize, delay_ms: f64) -> Self {
        Self {
            buffers: HashMap::new(),
            local: HashSet::new(),
            capacity,
            delay_ms,
        }
    }

    pub fn mark_local(&mut self, entity_id: impl Into<String>) {
        let id = entity_id.into();
        self.buffers.remove(&id);
        self.local.insert(id);
    }

    pub fn is_local(&self, entity_id: &str) -> bool {
        self.local.contains(entity_id)
    }

    /// Buffer a snapshot. Returns false for local entities, which are left alone.
    pub fn ingest(&mut self, entity_id: &str, state: RemoteState) -> bool {
        if self.is_local(entity_id) {
            return false;
        }
        let capacity = self.capacity;
        self.buffers
            .entry(entity_id.to_string())
            .or_insert_with(|| InterpolationBuffer::new(capacity))
            .add_state(state);
        true
    }

    /// Interpolated state for `now_ms` minus the configured delay.
    pub fn sample(&self, entity_id: &str, now_ms: f64) -> Option<RemoteState> {
        self.buffers
            .get(entity_id)?
            .get_interpolated_state(now_ms - self.delay_ms)
    }

    pub fn buffer(&self, entity_id: &str) -> Option<&InterpolationBuffer> {
        self.buffers.get(entity_id)
    }

    /// Drop an entity's buffer. Unknown ids are ignored.
    pub fn remove(&mut self, entity_id: &str) -> bool {
        self.buffers.remove(entity_id).is_some()
    }

    pub fn entity_ids(&self) -> impl Iterator<Item = &str> {
        self.buffers.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_state_returned_unchanged() {
        let mut buf = InterpolationBuffer::default();
        let s = RemoteState {
            rotation: Quat::from_rotation_y(0.7),
            grounded: true,
            ..RemoteState::at(Vec3::new(1.0, 2.0, 3.0), 500.0)
        };
        buf.add_state(s);
        assert_eq!(buf.get_interpolated_state(-1e6), Some(s));
        assert_eq!(buf.get_interpolated_state(500.0), Some(s));
        assert_eq!(buf.get_interpolated_state(1e9), Some(s));
    }

    #[test]
    fn empty_buffer_yields_none() {
        assert_eq!(InterpolationBuffer::default().get_interpolated_state(0.0), None);
    }

    #[test]
    fn midpoint_interpolation() {
        let mut buf = InterpolationBuffer::default();
        buf.add_state(RemoteState::at(Vec3::ZERO, 0.0));
        buf.add_state(RemoteState::at(Vec3::new(10.0, 0.0, 0.0), 100.0));
        let s = buf.get_interpolated_state(50.0).unwrap();
        assert!((s.position.x - 5.0).abs() < 1e-5);
    }

    #[test]
    fn extrapolation_is_bounded() {
        let mut buf = InterpolationBuffer::default();
        buf.add_state(RemoteState::at(Vec3::ZERO, 0.0));
        buf.add_state(RemoteState::at(Vec3::new(10.0, 0.0, 0.0), 100.0));
        let near = buf.get_interpolated_state(120.0).unwrap();
        assert!((near.position.x - 12.0).abs() < 1e-4);
        let far = buf.get_interpolated_state(10_000.0).unwrap();
        assert!((far.position.x - 15.0).abs() < 1e-4);
    }

    #[test]
    fn before_oldest_returns_oldest() {
        let mut buf = InterpolationBuffer::default();
        buf.add_state(RemoteState::at(Vec3::X, 100.0));
        buf.add_state(RemoteState::at(Vec3::Y, 200.0));
        assert_eq!(buf.get_interpolated_state(0.0).unwrap().position, Vec3::X);
    }

    #[test]
    fn capacity_drops_oldest() {
        let mut buf = InterpolationBuffer::new(3);
        for i in 0..5 {
            buf.add_state(RemoteState::at(Vec3::splat(i as f32), i as f64 * 10.0));
        }
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.get_interpolated_state(0.0).unwrap().timestamp, 20.0);
        assert_eq!(buf.latest().unwrap().timestamp, 40.0);
    }

    #[test]
    fn out_of_order_sample_is_sorted_in() {
        let mut buf = InterpolationBuffer::default();
        buf.add_state(RemoteState::at(Vec3::ZERO, 0.0));
        buf.add_state(RemoteState::at(Vec3::new(20.0, 0.0, 0.0), 200.0));
        buf.add_state(RemoteState::at(Vec3::new(10.0, 0.0, 0.0), 100.0));
        assert_eq!(buf.len(), 3);
        let s = buf.get_interpolated_state(150.0).unwrap();
        assert!((s.position.x - 15.0).abs() < 1e-5);
        assert_eq!(buf.latest().unwrap().timestamp, 200.0);

        // Duplicate timestamp replaces.
        buf.add_state(RemoteState::at(Vec3::new(11.0, 0.0, 0.0), 100.0));
        assert_eq!(buf.len(), 3);
        let s = buf.get_interpolated_state(100.0).unwrap();
        assert!((s.position.x - 11.0).abs() < 1e-5);
    }

    #[test]
    fn slerp_against_negation_stays_unit() {
        let q = Quat::from_rotation_y(1.2);
        let r = slerp_shortest(q, -q, 0.5);
        assert!((r.length() - 1.0).abs() < 1e-5);
        assert!(r.dot(q).abs() > 0.9999);
    }

    #[test]
    fn slerp_halfway() {
        let a = Quat::IDENTITY;
        let b = Quat::from_rotation_y(std::f32::consts::FRAC_PI_2);
        let r = slerp_shortest(a, b, 0.5);
        assert!(r.angle_between(Quat::from_rotation_y(std::f32::consts::FRAC_PI_4)) < 1e-4);
    }

    #[test]
    fn delay_from_broadcast_rate() {
        assert_eq!(interpolation_delay_ms(20.0), 100.0);
        assert_eq!(interpolation_delay_ms(60.0), 50.0);
        assert_eq!(interpolation_delay_ms(0.0), 50.0);
    }

    #[test]
    fn local_entities_are_not_buffered() {
        let mut buffers = RemoteBuffers::new(20, 100.0);
        buffers.mark_local("me");
        assert!(!buffers.ingest("me", RemoteState::at(Vec3::ZERO, 0.0)));
        assert!(buffers.ingest("them", RemoteState::at(Vec3::ZERO, 0.0)));
        assert!(buffers.sample("me", 100.0).is_none());
        assert!(buffers.sample("them", 100.0).is_some());
        assert!(buffers.remove("them"));
        assert!(!buffers.remove("them"));
    }
}
