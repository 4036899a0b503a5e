use std::{
    fmt,
    str::FromStr,
};

use headers::{
    Header,
    HeaderName,
    HeaderValue,
};

pub static RIPTIDE_CLIENT_HEADER_NAME: HeaderName = HeaderName::from_static("riptide-client");

/// Typed `Riptide-Client` header sent on the websocket handshake, e.g.
/// `rust-0.4.0`. The server uses it to detect clients that predate protocol
/// changes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientVersion {
    client: String,
    version: String,
}

impl ClientVersion {
    pub fn new_rust_client(version: &str) -> Self {
        Self {
            client: "rust".to_owned(),
            version: version.to_owned(),
        }
    }

    pub fn client(&self) -> &str {
        &self.client
    }

    pub fn version(&self) -> &str {
        &self.version
    }
}

impl FromStr for ClientVersion {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let Some((client, version)) = s.split_once('-') else {
            anyhow::bail!("Client version must look like `<client>-<version>`: {s}");
        };
        anyhow::ensure!(
            !client.is_empty() && !version.is_empty(),
            "Client version must look like `<client>-<version>`: {s}"
        );
        Ok(Self {
            client: client.to_owned(),
            version: version.to_owned(),
        })
    }
}

impl fmt::Display for ClientVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}-{}", self.client, self.version)
    }
}

impl Header for ClientVersion {
    fn name() -> &'static HeaderName {
        &RIPTIDE_CLIENT_HEADER_NAME
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let value = values.next().ok_or_else(headers::Error::invalid)?;
        let s = value.to_str().map_err(|_| headers::Error::invalid())?;
        s.parse().map_err(|_| headers::Error::invalid())
    }

    fn encode<E: Extend<HeaderValue>>(&self, values: &mut E) {
        let value = HeaderValue::from_str(&self.to_string())
            .expect("Client versions are always valid header values");
        values.extend(std::iter::once(value));
    }
}

#[cfg(test)]
mod tests {
    use headers::{
        HeaderMapExt,
        HeaderValue,
    };

    use super::ClientVersion;

    #[test]
    fn test_header_roundtrip() {
        let version = ClientVersion::new_rust_client("0.4.0");
        let mut map = headers::HeaderMap::new();
        map.typed_insert(version.clone());
        assert_eq!(
            map.get("riptide-client"),
            Some(&HeaderValue::from_static("rust-0.4.0"))
        );
        assert_eq!(map.typed_get::<ClientVersion>(), Some(version));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("rust".parse::<ClientVersion>().is_err());
        assert!("-1.0".parse::<ClientVersion>().is_err());
    }
}
