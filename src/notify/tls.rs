//! Broker endpoint parsing and TLS transport selection.

use anyhow::{anyhow, Context, Result};
use rumqttc::Transport;
use std::path::Path;

/// PEM material for a TLS broker connection.
///
/// Without a CA the platform roots are used. Client certificate and key
/// must be supplied together.
#[derive(Clone, Debug, Default)]
pub struct TlsMaterials {
    pub ca: Option<Vec<u8>>,
    pub client_auth: Option<(Vec<u8>, Vec<u8>)>,
}

impl TlsMaterials {
    pub fn load(
        ca_path: Option<&Path>,
        client_cert_path: Option<&Path>,
        client_key_path: Option<&Path>,
    ) -> Result<Self> {
        let ca = match ca_path {
            Some(path) => Some(
                std::fs::read(path)
                    .with_context(|| format!("failed to read MQTT TLS CA '{}'", path.display()))?,
            ),
            None => None,
        };

        let client_auth = match (client_cert_path, client_key_path) {
            (Some(cert_path), Some(key_path)) => {
                let cert = std::fs::read(cert_path).with_context(|| {
                    format!("failed to read MQTT TLS client cert '{}'", cert_path.display())
                })?;
                let key = std::fs::read(key_path).with_context(|| {
                    format!("failed to read MQTT TLS client key '{}'", key_path.display())
                })?;
                Some((cert, key))
            }
            (None, None) => None,
            (Some(_), None) => {
                return Err(anyhow!("MQTT TLS client certificate provided without key"))
            }
            (None, Some(_)) => {
                return Err(anyhow!("MQTT TLS client key provided without certificate"))
            }
        };

        Ok(Self { ca, client_auth })
    }

    pub fn is_configured(&self) -> bool {
        self.ca.is_some() || self.client_auth.is_some()
    }

    /// Transport for `endpoint`; plain TCP unless the endpoint asks for TLS.
    pub fn build_transport(&self, endpoint: &MqttEndpoint) -> Result<Transport> {
        if !endpoint.use_tls {
            if self.is_configured() {
                return Err(anyhow!(
                    "MQTT TLS materials provided but TLS is disabled (use mqtts:// or use_tls)"
                ));
            }
            return Ok(Transport::tcp());
        }
        if !self.is_configured() {
            return Ok(Transport::tls_with_default_config());
        }
        let ca = self.ca.clone().ok_or_else(|| {
            anyhow!("MQTT TLS CA certificate is required when providing client certificates")
        })?;
        Ok(Transport::tls(ca, self.client_auth.clone(), None))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

/// Parse `host:port`, `[v6]:port` or a `mqtt://`, `tcp://`, `mqtts://`,
/// `ssl://` prefixed address.
pub fn parse_mqtt_endpoint(addr: &str, tls_override: bool) -> Result<MqttEndpoint> {
    let mut use_tls = tls_override;
    let mut remainder = addr.trim();

    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            "mqtts" | "ssl" => use_tls = true,
            other => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
        }
        remainder = rest;
    }

    let (host, port) = split_host_port(remainder)?;
    if host.is_empty() {
        return Err(anyhow!("missing MQTT host in {}", addr));
    }
    Ok(MqttEndpoint {
        host,
        port,
        use_tls,
    })
}

fn split_host_port(addr: &str) -> Result<(String, u16)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid MQTT address: {}", addr))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
        let port: u16 = port
            .parse()
            .with_context(|| format!("invalid MQTT port in {}", addr))?;
        return Ok((host.to_string(), port));
    }

    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid MQTT port in {}", addr))?;
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_endpoint_plain() -> Result<()> {
        let ep = parse_mqtt_endpoint("127.0.0.1:1883", false)?;
        assert_eq!(ep.host, "127.0.0.1");
        assert_eq!(ep.port, 1883);
        assert!(!ep.use_tls);
        Ok(())
    }

    #[test]
    fn parse_endpoint_schemes() -> Result<()> {
        let ep = parse_mqtt_endpoint("mqtts://broker.example.com:8883", false)?;
        assert_eq!(ep.host, "broker.example.com");
        assert!(ep.use_tls);
        assert!(!parse_mqtt_endpoint("tcp://localhost:1883", false)?.use_tls);
        assert!(parse_mqtt_endpoint("localhost:8883", true)?.use_tls);
        assert!(parse_mqtt_endpoint("ws://localhost:1883", false).is_err());
        Ok(())
    }

    #[test]
    fn parse_endpoint_ipv6() -> Result<()> {
        let ep = parse_mqtt_endpoint("[::1]:1883", false)?;
        assert_eq!(ep.host, "::1");
        assert_eq!(ep.port, 1883);
        Ok(())
    }

    #[test]
    fn parse_endpoint_rejects_missing_parts() {
        assert!(parse_mqtt_endpoint("localhost", false).is_err());
        assert!(parse_mqtt_endpoint(":1883", false).is_err());
        assert!(parse_mqtt_endpoint("localhost:port", false).is_err());
    }

    #[test]
    fn client_cert_requires_key() {
        let cert_only = TlsMaterials::load(None, Some(Path::new("/nonexistent/cert.pem")), None);
        let err = cert_only.err().map(|e| e.to_string()).unwrap_or_default();
        assert!(err.contains("without key"));
    }

    #[test]
    fn materials_without_tls_are_rejected() {
        let materials = TlsMaterials {
            ca: Some(b"pem".to_vec()),
            client_auth: None,
        };
        let ep = MqttEndpoint {
            host: "localhost".into(),
            port: 1883,
            use_tls: false,
        };
        assert!(materials.build_transport(&ep).is_err());
    }
}
