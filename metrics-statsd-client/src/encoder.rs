use std::{collections::HashMap, fmt, io::Write as _};

use parking_lot::RwLock;

/// Metric type, which selects the type suffix written after the value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetricKind {
    /// A counter (`|c`).
    Count,

    /// A gauge (`|g`).
    Gauge,

    /// A timing, in milliseconds (`|ms`).
    Timing,

    /// A histogram (`|h`).
    Histogram,

    /// A set of unique values (`|s`).
    Set,
}

impl MetricKind {
    fn as_bytes(self) -> &'static [u8] {
        match self {
            MetricKind::Count => b"|c",
            MetricKind::Gauge => b"|g",
            MetricKind::Timing => b"|ms",
            MetricKind::Histogram => b"|h",
            MetricKind::Set => b"|s",
        }
    }

    /// Returns `true` if lines of this kind carry a `|@<rate>` annotation when sampled.
    fn carries_sample_rate(self) -> bool {
        matches!(self, MetricKind::Count | MetricKind::Timing | MetricKind::Histogram)
    }
}

/// Tag format of a connection.
///
/// The tag format decides where the pre-assembled tag string of a metric is placed in its line: InfluxDB-style tags
/// follow the bucket name, while Datadog-style tags are appended at the end of the line.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TagFormat {
    /// Tags are never written.
    #[default]
    None,

    /// `bucket,k=v,k2=v2:1|c`
    InfluxDb,

    /// `bucket:1|c|#k:v,k2:v2`
    Datadog,
}

/// A numeric metric value.
///
/// Every primitive integer and float converts into a `Number` through `From`, so the facade methods accept any of
/// them directly.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Number {
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    Isize(isize),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    Usize(usize),
    F32(f32),
    F64(f64),
}

impl Number {
    /// Returns `true` if the value is strictly less than zero.
    pub fn is_negative(&self) -> bool {
        match *self {
            Number::I8(v) => v < 0,
            Number::I16(v) => v < 0,
            Number::I32(v) => v < 0,
            Number::I64(v) => v < 0,
            Number::Isize(v) => v < 0,
            Number::U8(_) | Number::U16(_) | Number::U32(_) | Number::U64(_) | Number::Usize(_) => false,
            Number::F32(v) => v < 0.0,
            Number::F64(v) => v < 0.0,
        }
    }
}

macro_rules! impl_from_for_number {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Number {
                fn from(value: $ty) -> Self {
                    Number::$variant(value)
                }
            }
        )*
    };
}

impl_from_for_number!(
    i8 => I8,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    isize => Isize,
    u8 => U8,
    u16 => U16,
    u32 => U32,
    u64 => U64,
    usize => Usize,
    f32 => F32,
    f64 => F64,
);

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut buf = Vec::new();
        write_number(&mut buf, *self);
        f.write_str(&String::from_utf8_lossy(&buf))
    }
}

/// The value of a metric record.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MetricValue<'a> {
    /// A numeric value.
    Number(Number),

    /// A raw string value, used by sets.
    Text(&'a str),
}

/// A single metric, ready to be encoded.
///
/// Records borrow everything they point to and only live for the duration of a single send call.
#[derive(Clone, Copy, Debug)]
pub struct Metric<'a> {
    /// Metric type.
    pub kind: MetricKind,

    /// Prefix written in front of the bucket, including any trailing separator.
    pub prefix: &'a str,

    /// Bucket name.
    pub bucket: &'a str,

    /// Value.
    pub value: MetricValue<'a>,

    /// Sample rate the value was recorded at, where `1.0` means every call is sent.
    pub rate: f32,

    /// Pre-assembled tag string, as returned by [`join_tags`].
    pub tags: &'a str,
}

/// Cache of formatted sample rates.
///
/// Sample rates are usually drawn from a handful of configured values, so the decimal form of each one is rendered
/// once and then copied into every line that carries it.
pub(crate) struct RateFormatCache {
    rates: RwLock<HashMap<u32, Box<[u8]>>>,
}

impl RateFormatCache {
    /// Creates a new `RateFormatCache` with the given rates already formatted.
    pub fn with_rates<I>(rates: I) -> Self
    where
        I: IntoIterator<Item = f32>,
    {
        let cache = Self { rates: RwLock::new(HashMap::new()) };
        let mut scratch = Vec::new();
        for rate in rates {
            scratch.clear();
            cache.write_rate(&mut scratch, rate);
        }
        cache
    }

    /// Writes the decimal form of `rate` to `buf`.
    pub fn write_rate(&self, buf: &mut Vec<u8>, rate: f32) {
        let key = rate.to_bits();
        if let Some(formatted) = self.rates.read().get(&key) {
            buf.extend_from_slice(formatted);
            return;
        }

        let start = buf.len();
        write_float(buf, rate);
        self.rates.write().entry(key).or_insert_with(|| buf[start..].into());
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.rates.read().len()
    }
}

/// Encodes metric records into StatsD lines.
pub(crate) struct Encoder {
    tag_format: TagFormat,
    rates: RateFormatCache,
}

impl Encoder {
    /// Creates a new `Encoder` for the given tag format, pre-formatting the given sample rates.
    pub fn new<I>(tag_format: TagFormat, known_rates: I) -> Self
    where
        I: IntoIterator<Item = f32>,
    {
        Self { tag_format, rates: RateFormatCache::with_rates(known_rates) }
    }

    pub fn tag_format(&self) -> TagFormat {
        self.tag_format
    }

    /// Appends the encoded form of `metric` to `buf`.
    ///
    /// Every call appends one or more complete, newline-terminated lines.
    pub fn encode(&self, buf: &mut Vec<u8>, metric: &Metric<'_>) {
        // Gauges cannot be set to a negative value directly: a leading `-` means "decrement by". Reset to zero first.
        if metric.kind == MetricKind::Gauge {
            if let MetricValue::Number(n) = metric.value {
                if n.is_negative() {
                    self.write_line(buf, metric, MetricValue::Number(Number::U8(0)));
                }
            }
        }

        self.write_line(buf, metric, metric.value);
    }

    #[allow(clippy::float_cmp)]
    fn write_line(&self, buf: &mut Vec<u8>, metric: &Metric<'_>, value: MetricValue<'_>) {
        buf.extend_from_slice(metric.prefix.as_bytes());
        buf.extend_from_slice(metric.bucket.as_bytes());
        if self.tag_format == TagFormat::InfluxDb {
            buf.extend_from_slice(metric.tags.as_bytes());
        }
        buf.push(b':');

        match value {
            MetricValue::Number(n) => write_number(buf, n),
            MetricValue::Text(s) => buf.extend_from_slice(s.as_bytes()),
        }

        buf.extend_from_slice(metric.kind.as_bytes());

        if metric.kind.carries_sample_rate() && metric.rate != 1.0 {
            buf.extend_from_slice(b"|@");
            self.rates.write_rate(buf, metric.rate);
        }

        if self.tag_format == TagFormat::Datadog {
            buf.extend_from_slice(metric.tags.as_bytes());
        }
        buf.push(b'\n');
    }
}

/// Assembles a tag string for the given format.
///
/// The result is meant to be stored once and then handed to every [`Metric`] as-is.
pub fn join_tags<K, V>(tag_format: TagFormat, tags: &[(K, V)]) -> String
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    let (lead, pair_sep) = match tag_format {
        TagFormat::None => return String::new(),
        TagFormat::InfluxDb => (",", '='),
        TagFormat::Datadog => ("|#", ':'),
    };
    if tags.is_empty() {
        return String::new();
    }

    let mut joined = String::from(lead);
    for (i, (k, v)) in tags.iter().enumerate() {
        if i > 0 {
            joined.push(',');
        }
        joined.push_str(k.as_ref());
        joined.push(pair_sep);
        joined.push_str(v.as_ref());
    }
    joined
}

fn write_number(buf: &mut Vec<u8>, n: Number) {
    let mut int_writer = itoa::Buffer::new();
    let formatted = match n {
        Number::I8(v) => int_writer.format(v),
        Number::I16(v) => int_writer.format(v),
        Number::I32(v) => int_writer.format(v),
        Number::I64(v) => int_writer.format(v),
        Number::Isize(v) => int_writer.format(v),
        Number::U8(v) => int_writer.format(v),
        Number::U16(v) => int_writer.format(v),
        Number::U32(v) => int_writer.format(v),
        Number::U64(v) => int_writer.format(v),
        Number::Usize(v) => int_writer.format(v),
        Number::F32(v) => return write_float(buf, v),
        Number::F64(v) => return write_float(buf, v),
    };
    buf.extend_from_slice(formatted.as_bytes());
}

/// Writes the shortest decimal form of `value` that round-trips, without an exponent.
fn write_float<F>(buf: &mut Vec<u8>, value: F)
where
    F: ryu::Float + fmt::Display,
{
    let mut float_writer = ryu::Buffer::new();
    let formatted = float_writer.format(value);

    // `ryu` switches to scientific notation outside of roughly 1e-5..1e16, while `Display` never does.
    if formatted.contains('e') {
        let _ = write!(buf, "{value}");
    } else {
        let trimmed = formatted.strip_suffix(".0").unwrap_or(formatted);
        buf.extend_from_slice(trimmed.as_bytes());
    }
}
