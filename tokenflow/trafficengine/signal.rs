use serde::{Deserialize, Serialize};

use crate::routing::{Edge, Point, Rgb};

/// Length substituted for zero-length segments.
const SEGMENT_EPSILON: f64 = 1e-6;

/// Identifier of an in-flight signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SignalId(pub u64);

/// Flattens forward edges into one round-trip polyline.
///
/// A hop's first point is dropped when it equals the previous hop's last
/// point. The forward run is followed by its reverse (minus the turn-around
/// point). Returns the points and the split index, the last forward segment
/// boundary.
#[must_use]
pub fn round_trip_points(edges: &[&Edge]) -> (Vec<Point>, usize) {
    let mut forward: Vec<Point> = Vec::new();
    for edge in edges {
        for (idx, point) in edge.points.iter().enumerate() {
            if idx == 0 && forward.last() == Some(point) {
                continue;
            }
            forward.push(*point);
        }
    }
    let split_index = forward.len().saturating_sub(1);
    let mut points = forward.clone();
    points.extend(forward.iter().rev().skip(1));
    (points, split_index)
}

/// One request travelling out to its model and back.
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    id: SignalId,
    points: Vec<Point>,
    segment: usize,
    t: f64,
    speed: f64,
    split_index: usize,
    dead: bool,
    color_out: Rgb,
    color_back: Rgb,
}

impl Signal {
    /// Builds a round-trip signal over `edges`; `None` when the path has fewer than two points.
    #[must_use]
    pub fn round_trip(
        id: SignalId,
        edges: &[&Edge],
        speed: f64,
        color_out: Rgb,
        color_back: Rgb,
    ) -> Option<Self> {
        let (points, split_index) = round_trip_points(edges);
        Self::from_points(id, points, split_index, speed, color_out, color_back)
    }

    /// Builds a signal over an explicit polyline.
    #[must_use]
    pub fn from_points(
        id: SignalId,
        points: Vec<Point>,
        split_index: usize,
        speed: f64,
        color_out: Rgb,
        color_back: Rgb,
    ) -> Option<Self> {
        if points.len() < 2 {
            return None;
        }
        Some(Self {
            id,
            points,
            segment: 0,
            t: 0.0,
            speed: speed.max(0.0),
            split_index,
            dead: false,
            color_out,
            color_back,
        })
    }

    /// Identifier.
    #[must_use]
    pub fn id(&self) -> SignalId {
        self.id
    }

    /// Full round-trip polyline.
    #[must_use]
    pub fn points(&self) -> &[Point] {
        &self.points
    }

    /// Boundary between outbound and return segments.
    #[must_use]
    pub fn split_index(&self) -> usize {
        self.split_index
    }

    /// Current segment index.
    #[must_use]
    pub fn segment(&self) -> usize {
        self.segment
    }

    /// Whether the round trip finished.
    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.dead
    }

    fn segment_len(&self, segment: usize) -> f64 {
        self.points[segment]
            .distance(self.points[segment + 1])
            .max(SEGMENT_EPSILON)
    }

    /// Advances by `speed * dt` along the path.
    ///
    /// Returns `true` exactly once, on the step that finishes the last
    /// segment. Later calls are no-ops returning `false`.
    pub fn step(&mut self, dt: f64) -> bool {
        if self.dead {
            return false;
        }
        let mut budget = if dt.is_finite() { self.speed * dt.max(0.0) } else { 0.0 };
        let last_segment = self.points.len() - 2;
        loop {
            let len = self.segment_len(self.segment);
            let left = (1.0 - self.t) * len;
            if budget < left {
                self.t += budget / len;
                return false;
            }
            budget -= left;
            if self.segment == last_segment {
                self.t = 1.0;
                self.dead = true;
                return true;
            }
            self.segment += 1;
            self.t = 0.0;
        }
    }

    /// Current interpolated position.
    #[must_use]
    pub fn xy(&self) -> Point {
        self.points[self.segment].lerp(self.points[self.segment + 1], self.t)
    }

    /// Outbound color before the split, return color from it onwards.
    #[must_use]
    pub fn color(&self) -> Rgb {
        if self.segment < self.split_index {
            self.color_out
        } else {
            self.color_back
        }
    }
}

/// Moves in-flight signals and reports which ones finished.
///
/// The orchestrator polls [`PathDriver::step`] each tick and records the
/// returns itself, so drivers never call back into aggregation.
pub trait PathDriver {
    /// Starts a round-trip signal; `None` when the edges yield no drawable path.
    fn add_round_trip_signal(
        &mut self,
        edges: &[&Edge],
        speed: f64,
        color_out: Rgb,
        color_back: Rgb,
    ) -> Option<SignalId>;

    /// Number of live signals.
    fn signal_count(&self) -> usize;

    /// Advances all live signals and returns the ids that completed.
    fn step(&mut self, dt: f64) -> Vec<SignalId>;

    /// Drops every live signal without reporting completion.
    fn clear(&mut self);
}

/// Default in-memory driver.
#[derive(Debug, Clone, Default)]
pub struct SignalPool {
    next_id: u64,
    signals: Vec<Signal>,
}

impl SignalPool {
    /// Creates an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Live signals, for rendering.
    #[must_use]
    pub fn signals(&self) -> &[Signal] {
        &self.signals
    }
}

impl PathDriver for SignalPool {
    fn add_round_trip_signal(
        &mut self,
        edges: &[&Edge],
        speed: f64,
        color_out: Rgb,
        color_back: Rgb,
    ) -> Option<SignalId> {
        let id = SignalId(self.next_id);
        let signal = Signal::round_trip(id, edges, speed, color_out, color_back)?;
        self.next_id += 1;
        self.signals.push(signal);
        Some(id)
    }

    fn signal_count(&self) -> usize {
        self.signals.len()
    }

    fn step(&mut self, dt: f64) -> Vec<SignalId> {
        let mut finished = Vec::new();
        for signal in &mut self.signals {
            if signal.step(dt) {
                finished.push(signal.id());
            }
        }
        self.signals.retain(|signal| !signal.is_dead());
        finished
    }

    fn clear(&mut self) {
        self.signals.clear();
    }
}
