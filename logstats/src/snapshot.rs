//! 统计快照
//!
//! 快照是 key → value 的映射，value 只支持有限几种类型：
//! ```text
//!   Int     有符号 64 位整数
//!   Uint    超出 i64 范围的无符号 64 位整数
//!   Bool    布尔
//!   Str     字符串
//!   Nested  嵌套快照
//!   Opaque  其他 JSON 值（浮点、数组、null），原样透传
//! ```
//! 文本形式为紧凑 JSON，key 按字典序输出。
//!
//! 时间点用 [`Timestamp`] 写入，转换成 `Str`。

use std::collections::btree_map::{self, BTreeMap};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Local};
use serde::{Deserialize, Serialize, Serializer};

use crate::error::Result;

/// 快照中的单个值
///
/// 反序列化时按声明顺序尝试，整数优先落到 `Int`，放不下再落到 `Uint`。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Uint(u64),
    Bool(bool),
    Str(String),
    Nested(Snapshot),
    Opaque(serde_json::Value),
}

impl Value {
    /// 去重用的相等判断：只有同类型的基础值相等才算未变化
    ///
    /// 嵌套快照由调用方递归处理，`Opaque` 永远视为已变化。
    pub fn unchanged_from(&self, prev: &Value) -> bool {
        match (self, prev) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Uint(a), Value::Uint(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            _ => false,
        }
    }

    pub fn as_nested(&self) -> Option<&Snapshot> {
        match self {
            Value::Nested(s) => Some(s),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        // 与反序列化保持一致：放得进 i64 的都是 Int
        match i64::try_from(v) {
            Ok(i) => Value::Int(i),
            Err(_) => Value::Uint(v),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Snapshot> for Value {
    fn from(v: Snapshot) -> Self {
        Value::Nested(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Opaque(v)
    }
}

/// 自定义时间点渲染
pub type TimestampRenderer = Arc<dyn Fn(&DateTime<Local>) -> String + Send + Sync>;

/// 时间点统计值
///
/// 默认渲染为到现在经过的时间（如 `1m30.5s`），每次写入都不同；
/// 指定渲染函数后按函数输出，输出不变时可以被去重。
#[derive(Clone)]
pub struct Timestamp {
    at: DateTime<Local>,
    renderer: Option<TimestampRenderer>,
}

impl Timestamp {
    pub fn new(at: DateTime<Local>) -> Self {
        Self { at, renderer: None }
    }

    pub fn now() -> Self {
        Self::new(Local::now())
    }

    pub fn with_renderer<F>(at: DateTime<Local>, renderer: F) -> Self
    where
        F: Fn(&DateTime<Local>) -> String + Send + Sync + 'static,
    {
        Self {
            at,
            renderer: Some(Arc::new(renderer)),
        }
    }

    pub fn at(&self) -> &DateTime<Local> {
        &self.at
    }

    /// 从该时间点到 `now` 经过的时间
    pub fn since(&self, now: &DateTime<Local>) -> String {
        format_elapsed(now.signed_duration_since(self.at))
    }

    pub fn render(&self) -> String {
        match &self.renderer {
            Some(render) => render(&self.at),
            None => self.since(&Local::now()),
        }
    }
}

impl PartialEq for Timestamp {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timestamp")
            .field("at", &self.at)
            .field("custom", &self.renderer.is_some())
            .finish()
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.render())
    }
}

impl From<Timestamp> for Value {
    fn from(ts: Timestamp) -> Self {
        Value::Str(ts.render())
    }
}

/// 时长的文本形式：`1h2m3.5s`、`2m0s`、`1.5ms`、`250ns`
pub fn format_elapsed(d: Duration) -> String {
    let Some(nanos) = d.num_nanoseconds() else {
        return format!("{}s", d.num_seconds());
    };
    if nanos == 0 {
        return "0s".to_string();
    }

    let sign = if nanos < 0 { "-" } else { "" };
    let n = nanos.unsigned_abs();
    if n < 1_000 {
        return format!("{}{}ns", sign, n);
    }
    if n < 1_000_000 {
        return format!("{}{}µs", sign, with_fraction(n, 1_000));
    }
    if n < 1_000_000_000 {
        return format!("{}{}ms", sign, with_fraction(n, 1_000_000));
    }

    let secs = n / 1_000_000_000;
    let (h, m) = (secs / 3600, secs % 3600 / 60);
    let s = with_fraction(secs % 60 * 1_000_000_000 + n % 1_000_000_000, 1_000_000_000);
    if h > 0 {
        format!("{}{}h{}m{}s", sign, h, m, s)
    } else if m > 0 {
        format!("{}{}m{}s", sign, m, s)
    } else {
        format!("{}{}s", sign, s)
    }
}

/// `n / unit`，去掉小数末尾的 0
fn with_fraction(n: u64, unit: u64) -> String {
    let (whole, rem) = (n / unit, n % unit);
    if rem == 0 {
        return whole.to_string();
    }
    let width = unit.ilog10() as usize;
    let frac = format!("{:0width$}", rem, width = width);
    format!("{}.{}", whole, frac.trim_end_matches('0'))
}

/// 一次统计快照
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot(BTreeMap<String, Value>);

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<K: Into<String>, V: Into<Value>>(&mut self, key: K, value: V) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    /// 链式构造
    pub fn with<K: Into<String>, V: Into<Value>>(mut self, key: K, value: V) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, Value> {
        self.0.iter()
    }

    /// 用基线补全缺失的 key（回放时撤销去重）
    ///
    /// 基线中有、当前没有的 key 直接拷贝；两边都是嵌套快照时递归补全。
    /// 已被删除的 key 无法区分，同样会被补回来。
    pub fn fill_forward(&mut self, baseline: &Snapshot) {
        for (key, prev) in baseline.iter() {
            match self.0.get_mut(key) {
                None => {
                    self.0.insert(key.clone(), prev.clone());
                }
                Some(Value::Nested(curr)) => {
                    if let Value::Nested(prev) = prev {
                        curr.fill_forward(prev);
                    }
                }
                Some(_) => {}
            }
        }
    }

    /// 序列化为紧凑 JSON
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// 从 JSON 对象反序列化
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl From<BTreeMap<String, Value>> for Snapshot {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Self(map)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Snapshot {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl<'a> IntoIterator for &'a Snapshot {
    type Item = (&'a String, &'a Value);
    type IntoIter = btree_map::Iter<'a, String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_value_kinds() {
        let json = br#"{"a":-3,"b":18446744073709551615,"c":true,"d":"x","e":{"f":1},"g":1.5,"h":[1,2],"i":null}"#;
        let snap = Snapshot::from_slice(json).unwrap();

        assert_eq!(snap.get("a"), Some(&Value::Int(-3)));
        assert_eq!(snap.get("b"), Some(&Value::Uint(u64::MAX)));
        assert_eq!(snap.get("c"), Some(&Value::Bool(true)));
        assert_eq!(snap.get("d"), Some(&Value::Str("x".into())));
        assert_eq!(
            snap.get("e"),
            Some(&Value::Nested(Snapshot::new().with("f", 1i64)))
        );
        assert!(matches!(snap.get("g"), Some(Value::Opaque(_))));
        assert!(matches!(snap.get("h"), Some(Value::Opaque(_))));
        assert!(matches!(snap.get("i"), Some(Value::Opaque(_))));
    }

    #[test]
    fn test_encode_sorted_compact() {
        let snap = Snapshot::new()
            .with("k2", "V2")
            .with("k1", 10i64)
            .with("k0", Snapshot::new().with("z", false).with("y", 1u64));

        let bytes = snap.to_vec().unwrap();
        assert_eq!(
            String::from_utf8(bytes.clone()).unwrap(),
            r#"{"k0":{"y":1,"z":false},"k1":10,"k2":"V2"}"#
        );
        assert_eq!(Snapshot::from_slice(&bytes).unwrap(), snap);
    }

    #[test]
    fn test_non_object_payload_rejected() {
        assert!(Snapshot::from_slice(b"[1,2,3]").is_err());
        assert!(Snapshot::from_slice(b"{\"a\":1").is_err());
    }

    #[test]
    fn test_unchanged_from() {
        assert!(Value::Int(1).unchanged_from(&Value::Int(1)));
        assert!(!Value::Int(1).unchanged_from(&Value::Int(2)));
        assert!(Value::Str("a".into()).unchanged_from(&Value::Str("a".into())));
        // 类型变化视为已变化
        assert!(!Value::Int(1).unchanged_from(&Value::Uint(1)));
        assert!(!Value::Bool(true).unchanged_from(&Value::Str("true".into())));
        // Opaque 永远视为已变化
        let f = Value::Opaque(serde_json::json!(1.5));
        assert!(!f.unchanged_from(&f.clone()));
    }

    #[test]
    fn test_fill_forward_recursive() {
        let baseline = Snapshot::new()
            .with("k1", 10i64)
            .with("k2", "V2")
            .with("k3", Snapshot::new().with("k31", 310i64).with("k32", "V32"));

        let mut delta = Snapshot::new()
            .with("k1", 99i64)
            .with("k3", Snapshot::new().with("k31", 1i64));
        delta.fill_forward(&baseline);

        let expected = Snapshot::new()
            .with("k1", 99i64)
            .with("k2", "V2")
            .with("k3", Snapshot::new().with("k31", 1i64).with("k32", "V32"));
        assert_eq!(delta, expected);
    }

    #[test]
    fn test_fill_forward_type_change_keeps_current() {
        let baseline = Snapshot::new().with("k", Snapshot::new().with("a", 1i64));
        let mut curr = Snapshot::new().with("k", 5i64);
        curr.fill_forward(&baseline);
        assert_eq!(curr.get("k"), Some(&Value::Int(5)));
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::zero()), "0s");
        assert_eq!(format_elapsed(Duration::nanoseconds(250)), "250ns");
        assert_eq!(format_elapsed(Duration::microseconds(2)), "2µs");
        assert_eq!(format_elapsed(Duration::microseconds(1500)), "1.5ms");
        assert_eq!(format_elapsed(Duration::milliseconds(1500)), "1.5s");
        assert_eq!(format_elapsed(Duration::milliseconds(90_500)), "1m30.5s");
        assert_eq!(format_elapsed(Duration::seconds(120)), "2m0s");
        assert_eq!(format_elapsed(Duration::hours(1)), "1h0m0s");
        assert_eq!(format_elapsed(Duration::seconds(-3)), "-3s");
    }

    #[test]
    fn test_timestamp_since() {
        let at = Local::now();
        let ts = Timestamp::new(at);
        assert_eq!(ts.since(&(at + Duration::seconds(5))), "5s");

        // 默认渲染是到现在的间隔
        let ts = Timestamp::new(at - Duration::seconds(120));
        let rendered = ts.render();
        assert!(rendered.starts_with("2m0"), "{}", rendered);
        assert!(rendered.ends_with('s'));
    }

    #[test]
    fn test_timestamp_custom_renderer() {
        let at = Local::now();
        let ts = Timestamp::with_renderer(at, |t| t.format("%Y").to_string());
        let year = at.format("%Y").to_string();

        let snap = Snapshot::new().with("boot", ts.clone());
        assert_eq!(snap.get("boot"), Some(&Value::Str(year.clone())));
        assert_eq!(serde_json::to_string(&ts).unwrap(), format!("\"{}\"", year));

        // 相等只看时间点
        assert_eq!(ts, Timestamp::new(at));
    }
}
