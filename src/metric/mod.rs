//! The point model. A point is one measurement destined for the time-series
//! backend: a metric name, a tag set, a unix-seconds timestamp and either a
//! numeric value or a text payload.

use time;

mod tagmap;

pub use self::tagmap::TagMap;

/// A numeric measurement.
///
/// Serializes as `{"metric": .., "tags": {..}, "timestamp": .., "value": ..}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NumberPoint {
    /// The metric name.
    pub metric: String,
    /// Key / value metadata distinguishing identically named points.
    pub tags: TagMap,
    /// Unix time, in seconds.
    pub timestamp: i64,
    /// The measured value.
    pub value: f64,
}

/// A textual measurement.
///
/// Serializes as `{"metric": .., "tags": {..}, "timestamp": .., "text": ..}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TextPoint {
    /// The metric name.
    pub metric: String,
    /// Key / value metadata distinguishing identically named points.
    pub tags: TagMap,
    /// Unix time, in seconds.
    pub timestamp: i64,
    /// The text payload.
    pub text: String,
}

/// Either kind of point. This is what flows through the transports.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Point {
    /// A numeric measurement.
    Number(NumberPoint),
    /// A textual measurement.
    Text(TextPoint),
}

impl NumberPoint {
    /// Make a new NumberPoint
    ///
    /// The timestamp defaults to `time::now()`.
    ///
    /// # Examples
    ///
    /// ```
    /// use emissary::metric::NumberPoint;
    ///
    /// let p = NumberPoint::new("cpu.idle", 98.5);
    ///
    /// assert_eq!(p.metric, "cpu.idle");
    /// assert_eq!(p.value, 98.5);
    /// assert!(p.tags.is_empty());
    /// ```
    pub fn new<S>(metric: S, value: f64) -> NumberPoint
    where
        S: Into<String>,
    {
        NumberPoint {
            metric: metric.into(),
            tags: TagMap::default(),
            timestamp: time::now(),
            value: value,
        }
    }

    /// Adjust the point's timestamp, taken to be unix seconds.
    pub fn timestamp(mut self, ts: i64) -> NumberPoint {
        self.timestamp = ts;
        self
    }

    /// Overlay a specific key / value pair in self's tags
    ///
    /// If the key was already present in the tag map the value will be
    /// replaced, else it will be inserted.
    pub fn overlay_tag<S>(mut self, key: S, val: S) -> NumberPoint
    where
        S: Into<String>,
    {
        self.tags.insert(key.into(), val.into());
        self
    }
}

impl TextPoint {
    /// Make a new TextPoint
    ///
    /// The timestamp defaults to `time::now()`.
    pub fn new<S>(metric: S, text: S) -> TextPoint
    where
        S: Into<String>,
    {
        TextPoint {
            metric: metric.into(),
            tags: TagMap::default(),
            timestamp: time::now(),
            text: text.into(),
        }
    }

    /// Adjust the point's timestamp, taken to be unix seconds.
    pub fn timestamp(mut self, ts: i64) -> TextPoint {
        self.timestamp = ts;
        self
    }

    /// Overlay a specific key / value pair in self's tags
    pub fn overlay_tag<S>(mut self, key: S, val: S) -> TextPoint
    where
        S: Into<String>,
    {
        self.tags.insert(key.into(), val.into());
        self
    }
}

impl Point {
    /// The point's metric name.
    pub fn metric(&self) -> &str {
        match *self {
            Point::Number(ref p) => &p.metric,
            Point::Text(ref p) => &p.metric,
        }
    }

    /// The point's timestamp, in unix seconds.
    pub fn timestamp(&self) -> i64 {
        match *self {
            Point::Number(ref p) => p.timestamp,
            Point::Text(ref p) => p.timestamp,
        }
    }

    /// The point's tags, read-only.
    pub fn tags(&self) -> &TagMap {
        match *self {
            Point::Number(ref p) => &p.tags,
            Point::Text(ref p) => &p.tags,
        }
    }

    /// Overlay self's tags with a TagMap
    ///
    /// Any new keys will be inserted while existing keys will be
    /// overwritten. This is how the manager applies default tags, so
    /// defaults beat caller tags sharing a key.
    pub fn overlay_tags_from_map(&mut self, map: &TagMap) {
        match *self {
            Point::Number(ref mut p) => p.tags.overlay(map),
            Point::Text(ref mut p) => p.tags.overlay(map),
        }
    }
}

impl From<NumberPoint> for Point {
    fn from(p: NumberPoint) -> Point {
        Point::Number(p)
    }
}

impl From<TextPoint> for Point {
    fn from(p: TextPoint) -> Point {
        Point::Text(p)
    }
}
