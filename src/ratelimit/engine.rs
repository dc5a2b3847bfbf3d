//! The admission routine.
//!
//! Both forms below implement the same bucket maintenance and decision: the Lua
//! script runs server-side in Redis, [`admit`] runs inside the in-process store
//! while it holds the key's lock. Either way, one invocation is indivisible with
//! respect to any other invocation on the same key.
//!
//! A key's record is a map of `"<truncated ts>:<precision secs>"` to a positive
//! count, with one TTL for the whole record. Buckets of other precisions share
//! the record and are left alone unless they are stale or malformed.

use std::collections::BTreeMap;
use std::fmt;

use tracing::trace;

use super::window::Window;
use crate::store::Routine;

/// Argument count expected by the routine.
pub const ARG_COUNT: usize = 6;

/// Server-side form of the admission routine.
///
/// KEYS[1] is the rate limited key. ARGV is
/// `[now, start_of_window, end_of_window, precision_secs, stale_age_secs, threshold]`.
pub const ADMISSION_SCRIPT: &str = r#"
local key = KEYS[1]
-- keeps unpack() well under the Lua stack limit
local delete_batch = 1000

local function int_arg(raw)
    if type(raw) ~= "string" or not string.match(raw, "^%-?%d+$") then
        return nil
    end
    return tonumber(raw)
end

local current_ts = int_arg(ARGV[1])
local start_ts = int_arg(ARGV[2])
local end_ts = int_arg(ARGV[3])
local precision = int_arg(ARGV[4])
local stale_age = int_arg(ARGV[5])
local threshold = int_arg(ARGV[6])

if not current_ts or not start_ts or not end_ts or not precision or not stale_age or not threshold then
    return -3
end

if threshold <= 0 then
    return -2
end

local window_length = end_ts - start_ts
if window_length < 0 then
    return -1
end

local expiry = window_length + precision
local current_field = string.format("%d:%d", end_ts, precision)

if redis.call("EXISTS", key) == 0 then
    redis.call("HINCRBY", key, current_field, 1)
    redis.call("EXPIRE", key, expiry)
    return 1
end

local fields = redis.call("HGETALL", key)
local total = 1
local to_delete = {}

for i = 1, #fields, 2 do
    local field = fields[i]
    local count = int_arg(fields[i + 1])
    local ts, tag
    local sep = string.find(field, ":", 1, true)
    if sep then
        ts = int_arg(string.sub(field, 1, sep - 1))
        tag = int_arg(string.sub(field, sep + 1))
    end

    if not ts or not tag or not count or count <= 0 then
        table.insert(to_delete, field)
    elseif ts + stale_age < current_ts then
        table.insert(to_delete, field)
    elseif tag == precision then
        if ts + window_length < current_ts then
            table.insert(to_delete, field)
        elseif ts >= start_ts and ts <= end_ts then
            total = total + count
        end
    end
end

for i = 1, #to_delete, delete_batch do
    redis.call("HDEL", key, unpack(to_delete, i, math.min(i + delete_batch - 1, #to_delete)))
end

local admitted = total <= threshold
if admitted then
    redis.call("HINCRBY", key, current_field, 1)
end

local ttl = redis.call("TTL", key)
if ttl ~= -2 and ttl < expiry then
    redis.call("EXPIRE", key, expiry)
end

if admitted then
    return 1
end
return 0
"#;

/// The routine identifier handed to stores.
pub static ADMISSION_ROUTINE: Routine = Routine::new("sliding_window_admission", ADMISSION_SCRIPT);

/// Numeric codes returned by the admission routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdmissionCode {
    /// The event is admitted and counted.
    Admit,
    /// The event would exceed the threshold and was not counted.
    Deny,
    /// `end_of_window < start_of_window`.
    WindowInvalid,
    /// Threshold is not positive.
    ThresholdInvalid,
    /// An argument is missing or not an integer.
    ArgsInvalid,
}

impl AdmissionCode {
    /// The wire value of this code.
    pub fn as_i64(self) -> i64 {
        match self {
            AdmissionCode::Admit => 1,
            AdmissionCode::Deny => 0,
            AdmissionCode::WindowInvalid => -1,
            AdmissionCode::ThresholdInvalid => -2,
            AdmissionCode::ArgsInvalid => -3,
        }
    }
}

impl TryFrom<i64> for AdmissionCode {
    type Error = i64;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(AdmissionCode::Admit),
            0 => Ok(AdmissionCode::Deny),
            -1 => Ok(AdmissionCode::WindowInvalid),
            -2 => Ok(AdmissionCode::ThresholdInvalid),
            -3 => Ok(AdmissionCode::ArgsInvalid),
            other => Err(other),
        }
    }
}

/// Parse a strictly formatted decimal integer: optional `-`, then digits.
///
/// Matches the `^%-?%d+$` check the script applies, so both forms agree on what
/// counts as malformed.
fn parse_int(raw: &str) -> Option<i64> {
    let digits = raw.strip_prefix('-').unwrap_or(raw);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    raw.parse().ok()
}

/// The bundled inputs of one admission call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionArgs {
    /// Untruncated current time, Unix seconds
    pub now: i64,
    /// Truncated start of window
    pub start_of_window: i64,
    /// Truncated end of window
    pub end_of_window: i64,
    /// Bucket precision in seconds
    pub precision_secs: i64,
    /// Absolute maximum bucket age in seconds
    pub stale_age_secs: i64,
    /// Maximum admits per window
    pub threshold: i64,
}

impl AdmissionArgs {
    /// Encode in the routine's positional order.
    pub fn to_argv(&self) -> Vec<String> {
        vec![
            self.now.to_string(),
            self.start_of_window.to_string(),
            self.end_of_window.to_string(),
            self.precision_secs.to_string(),
            self.stale_age_secs.to_string(),
            self.threshold.to_string(),
        ]
    }

    /// Decode positional arguments. `None` when any is missing or not an integer.
    pub fn parse(argv: &[String]) -> Option<Self> {
        if argv.len() < ARG_COUNT {
            return None;
        }
        Some(Self {
            now: parse_int(&argv[0])?,
            start_of_window: parse_int(&argv[1])?,
            end_of_window: parse_int(&argv[2])?,
            precision_secs: parse_int(&argv[3])?,
            stale_age_secs: parse_int(&argv[4])?,
            threshold: parse_int(&argv[5])?,
        })
    }

    /// Check the threshold, then the window ordering.
    pub fn validate(&self) -> Result<(), AdmissionCode> {
        if self.threshold <= 0 {
            return Err(AdmissionCode::ThresholdInvalid);
        }
        if !self.window().is_valid() {
            return Err(AdmissionCode::WindowInvalid);
        }
        Ok(())
    }

    /// The window these arguments describe.
    pub fn window(&self) -> Window {
        Window::from_bounds(self.start_of_window, self.end_of_window)
    }

    /// TTL applied to the record: window length plus one bucket.
    pub fn expiry(&self) -> i64 {
        self.window().length().saturating_add(self.precision_secs)
    }

    /// Field name of the bucket this call increments.
    pub fn current_bucket(&self) -> BucketId {
        BucketId {
            timestamp: self.end_of_window,
            precision_secs: self.precision_secs,
        }
    }
}

/// Identity of one bucket within a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketId {
    /// Truncated Unix timestamp of the slice
    pub timestamp: i64,
    /// Precision the slice was truncated to
    pub precision_secs: i64,
}

impl BucketId {
    /// Parse a `"<ts>:<precision>"` field name.
    pub fn parse(field: &str) -> Option<Self> {
        let (ts, precision) = field.split_once(':')?;
        Some(Self {
            timestamp: parse_int(ts)?,
            precision_secs: parse_int(precision)?,
        })
    }
}

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.timestamp, self.precision_secs)
    }
}

/// All buckets stored under one key, with the record's expiry.
///
/// Values are kept as raw strings, the way a hash stores them, so malformed
/// entries can be represented and pruned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BucketSet {
    fields: BTreeMap<String, String>,
    expires_at: Option<i64>,
}

impl BucketSet {
    /// Create an empty record with no expiry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a raw field, overwriting any previous value.
    pub fn insert(&mut self, field: impl Into<String>, value: impl ToString) {
        self.fields.insert(field.into(), value.to_string());
    }

    /// Raw fields of the record.
    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }

    /// Parsed count of a bucket, if present and well formed.
    pub fn count(&self, bucket: &BucketId) -> Option<i64> {
        self.fields.get(&bucket.to_string()).and_then(|v| parse_int(v))
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the record has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Absolute expiry, Unix seconds.
    pub fn expires_at(&self) -> Option<i64> {
        self.expires_at
    }

    /// Set the absolute expiry.
    pub fn set_expires_at(&mut self, expires_at: Option<i64>) {
        self.expires_at = expires_at;
    }

    /// Remaining lifetime at `now`. `None` when the record never expires.
    pub fn ttl(&self, now: i64) -> Option<i64> {
        self.expires_at.map(|at| at.saturating_sub(now))
    }

    /// Whether the record has expired at `now`.
    pub fn is_expired(&self, now: i64) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }

    fn increment(&mut self, bucket: &BucketId) {
        let field = bucket.to_string();
        let current = self.fields.get(&field).and_then(|v| parse_int(v)).unwrap_or(0);
        self.fields.insert(field, current.saturating_add(1).to_string());
    }

    /// Raise the expiry to `now + expiry` unless it is already later.
    fn raise_ttl(&mut self, expiry: i64, now: i64) {
        match self.ttl(now) {
            Some(ttl) if ttl >= expiry => {}
            _ => self.expires_at = Some(now.saturating_add(expiry)),
        }
    }
}

/// Result of running the routine once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evaluation {
    /// Code returned to the caller
    pub code: AdmissionCode,
    /// Fields deleted as stale, expired or malformed
    pub pruned: usize,
    /// Running total the decision was based on, including the current event
    pub running_total: i64,
}

impl Evaluation {
    fn rejected(code: AdmissionCode) -> Self {
        Self {
            code,
            pruned: 0,
            running_total: 0,
        }
    }
}

/// Run the admission routine against a key's record.
///
/// `record` is `None` when the key does not exist; an admitted first call
/// creates it, and a record left with no fields is removed again. `store_now`
/// is the store's own clock, used only for the TTL.
///
/// Callers must hold the key's exclusive lock for the whole call.
pub fn admit(record: &mut Option<BucketSet>, argv: &[String], store_now: i64) -> Evaluation {
    let args = match AdmissionArgs::parse(argv) {
        Some(args) => args,
        None => return Evaluation::rejected(AdmissionCode::ArgsInvalid),
    };
    if let Err(code) = args.validate() {
        return Evaluation::rejected(code);
    }

    let window = args.window();
    let window_length = window.length();
    let current = args.current_bucket();

    let set = match record {
        Some(set) => set,
        None => {
            let mut set = BucketSet::new();
            set.increment(&current);
            set.raise_ttl(args.expiry(), store_now);
            *record = Some(set);
            return Evaluation {
                code: AdmissionCode::Admit,
                pruned: 0,
                running_total: 1,
            };
        }
    };

    let mut running_total: i64 = 1;
    let mut to_delete = Vec::new();

    for (field, value) in set.fields.iter() {
        let bucket = BucketId::parse(field);
        let count = parse_int(value).filter(|c| *c > 0);

        let (bucket, count) = match (bucket, count) {
            (Some(bucket), Some(count)) => (bucket, count),
            _ => {
                to_delete.push(field.clone());
                continue;
            }
        };

        if bucket.timestamp.saturating_add(args.stale_age_secs) < args.now {
            to_delete.push(field.clone());
        } else if bucket.precision_secs == args.precision_secs {
            if bucket.timestamp.saturating_add(window_length) < args.now {
                to_delete.push(field.clone());
            } else if window.contains(bucket.timestamp) {
                running_total = running_total.saturating_add(count);
            }
        }
    }

    for field in &to_delete {
        set.fields.remove(field);
    }

    let admitted = running_total <= args.threshold;
    if admitted {
        set.increment(&current);
    }

    if set.is_empty() {
        *record = None;
    } else {
        set.raise_ttl(args.expiry(), store_now);
    }

    trace!(
        running_total = running_total,
        threshold = args.threshold,
        pruned = to_delete.len(),
        admitted = admitted,
        "Evaluated admission"
    );

    Evaluation {
        code: if admitted {
            AdmissionCode::Admit
        } else {
            AdmissionCode::Deny
        },
        pruned: to_delete.len(),
        running_total,
    }
}
