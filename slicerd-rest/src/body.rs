use serde::Deserialize;
use slicerd_core::{CircuitRequest, ConfigUpdate, Endpoint, LearnRequest};

use crate::ApiError;

/// The POST body. All keys are optional; unknown keys are ignored.
#[derive(Debug, Default, Deserialize)]
pub struct UpdateBody {
    #[serde(default)]
    pub slices: Vec<Vec<CircuitBody>>,
    #[serde(default)]
    pub disused: Vec<Vec<u64>>,
    pub learn: Option<LearnBody>,
}

#[derive(Debug, Deserialize)]
pub struct CircuitBody {
    pub circuit: Vec<u64>,
    #[serde(rename = "ingress-bw")]
    pub ingress_bw: Option<u32>,
    #[serde(rename = "egress-bw")]
    pub egress_bw: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct LearnBody {
    pub mac: String,
    pub tuple: Vec<u64>,
    pub timeout: Option<u16>,
}

/// Parse and range-check a request body into engine terms. An empty body is
/// an empty mutation, mirroring the original service.
pub fn parse(body: &str) -> Result<ConfigUpdate, ApiError> {
    if body.trim().is_empty() {
        return Ok(ConfigUpdate::default());
    }
    let parsed: UpdateBody = serde_json::from_str(body)?;

    let mut update = ConfigUpdate::default();
    for slice in &parsed.slices {
        let mut circuits = Vec::with_capacity(slice.len());
        for circuit in slice {
            circuits.push(CircuitRequest {
                endpoint: Endpoint::from_components(&circuit.circuit)
                    .map_err(slicerd_core::ConfigError::from)?,
                ingress_bw: circuit.ingress_bw,
                egress_bw: circuit.egress_bw,
            });
        }
        update.slices.push(circuits);
    }
    for components in &parsed.disused {
        update
            .disused
            .push(Endpoint::from_components(components).map_err(slicerd_core::ConfigError::from)?);
    }
    if let Some(learn) = &parsed.learn {
        update.learn = Some(LearnRequest {
            mac: learn.mac.parse()?,
            endpoint: Endpoint::from_components(&learn.tuple)
                .map_err(slicerd_core::ConfigError::from)?,
            timeout: learn.timeout,
        });
    }
    Ok(update)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use slicerd_core::ConfigError;
    use slicerd_openflow::MacAddr;

    use super::*;
    use crate::StatusCode;

    #[test]
    fn full_body_parses() {
        let update = parse(
            r#"{
                "slices": [[{"circuit": [1], "ingress-bw": 1000}, {"circuit": [2, 100]}]],
                "disused": [[3, 100, 200]],
                "learn": {"mac": "0a:00:00:00:00:01", "tuple": [1], "timeout": 300}
            }"#,
        )
        .unwrap();

        assert_eq!(update.slices.len(), 1);
        assert_eq!(update.slices[0][0].endpoint, Endpoint::Port(1));
        assert_eq!(update.slices[0][0].ingress_bw, Some(1000));
        assert_eq!(update.slices[0][1].endpoint, Endpoint::Tagged(2, 100));
        assert_eq!(update.disused, vec![Endpoint::DoubleTagged(3, 100, 200)]);
        let learn = update.learn.unwrap();
        assert_eq!(learn.mac, "0a:00:00:00:00:01".parse::<MacAddr>().unwrap());
        assert_eq!(learn.timeout, Some(300));
    }

    #[test]
    fn empty_body_is_an_empty_mutation() {
        assert_eq!(parse("").unwrap(), ConfigUpdate::default());
        assert_eq!(parse("{}").unwrap(), ConfigUpdate::default());
    }

    #[test]
    fn malformed_bodies_map_to_400() {
        // Not JSON at all.
        let err = parse("not json").unwrap_err();
        assert_eq!(err.status(), StatusCode::BadRequest);
        // Negative components fail integer deserialization.
        let err = parse(r#"{"slices": [[{"circuit": [-1]}]]}"#).unwrap_err();
        assert_eq!(err.status(), StatusCode::BadRequest);
        // Arity violations are engine-level configuration errors.
        let err = parse(r#"{"slices": [[{"circuit": [1, 2, 3, 4]}]]}"#).unwrap_err();
        assert!(matches!(
            err,
            crate::ApiError::Config(ConfigError::Endpoint(_))
        ));
    }
}
