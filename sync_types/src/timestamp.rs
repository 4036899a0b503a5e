use std::fmt;

use serde_json::Value as JsonValue;

/// Logical timestamp assigned by the backend. Timestamps are totally ordered
/// and advance monotonically within a session.
///
/// On the wire a timestamp is the base64 encoding of its little-endian bytes.
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    derive_more::Display,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(try_from = "JsonValue", into = "JsonValue")]
pub struct Timestamp(u64);

impl Timestamp {
    pub const MIN: Timestamp = Timestamp(0);

    pub fn succ(&self) -> anyhow::Result<Self> {
        let next = self
            .0
            .checked_add(1)
            .ok_or_else(|| anyhow::anyhow!("Timestamp overflow"))?;
        Ok(Timestamp(next))
    }

    pub fn to_base64(&self) -> String {
        base64::encode(self.0.to_le_bytes())
    }

    pub fn from_base64(encoded: &str) -> anyhow::Result<Self> {
        let bytes = base64::decode(encoded)?;
        let bytes: [u8; 8] = bytes[..]
            .try_into()
            .map_err(|_| anyhow::anyhow!("Timestamp must be 8 bytes, got {}", bytes.len()))?;
        Ok(Timestamp(u64::from_le_bytes(bytes)))
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

impl From<Timestamp> for JsonValue {
    fn from(ts: Timestamp) -> Self {
        JsonValue::String(ts.to_base64())
    }
}

impl TryFrom<JsonValue> for Timestamp {
    type Error = anyhow::Error;

    fn try_from(value: JsonValue) -> anyhow::Result<Self> {
        let JsonValue::String(s) = value else {
            anyhow::bail!("Timestamp must be a base64 string, got {value}");
        };
        Self::from_base64(&s)
    }
}

#[cfg(any(test, feature = "testing"))]
impl From<u64> for Timestamp {
    fn from(ts: u64) -> Self {
        Timestamp(ts)
    }
}

#[cfg(test)]
mod tests {
    use super::Timestamp;

    #[test]
    fn test_base64_roundtrip() -> anyhow::Result<()> {
        for ts in [Timestamp::MIN, Timestamp(1), Timestamp(1 << 40), Timestamp(u64::MAX)] {
            assert_eq!(Timestamp::from_base64(&ts.to_base64())?, ts);
        }
        Ok(())
    }

    #[test]
    fn test_base64_rejects_short_input() {
        assert!(Timestamp::from_base64("AAA=").is_err());
    }

    #[test]
    fn test_succ() -> anyhow::Result<()> {
        assert_eq!(Timestamp(7).succ()?, Timestamp(8));
        assert!(Timestamp(u64::MAX).succ().is_err());
        Ok(())
    }
}
