//! `ChannelRouting` definition documents
//!
//! ```yaml
//! apiVersion: parley/v1
//! kind: ChannelRouting
//! metadata:
//!   name: acme-web-stable
//!   labels:
//!     channel: web
//!     tenant: acme
//!     subset: stable
//! spec:
//!   mode: LLM
//!   capabilityGroups:
//!     - id: billing
//!       name: Billing Desk
//!       description: Invoices, refunds and payment questions
//!       host: http://billing.acme.internal
//!       capabilities:
//!         - name: view-invoice
//!         - name: refund
//! ```
//!
//! Each capability group becomes one candidate agent. A group without a host
//! of its own is reached through the host of its first capability that has one.

use parley_core::{AgentDescriptor, Channel, ChannelRoutingConfig, Result, RoutingMode, RuntimeError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

pub const CHANNEL_ROUTING_KIND: &str = "ChannelRouting";

const LABEL_CHANNEL: &str = "channel";
const LABEL_TENANT: &str = "tenant";
const LABEL_SUBSET: &str = "subset";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRoutingDocument {
    #[serde(default)]
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub metadata: DocumentMetadata,
    pub spec: ChannelRoutingSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRoutingSpec {
    /// EXPLICIT or LLM; inferred from the group count when absent
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub capability_groups: Vec<CapabilityGroup>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityGroup {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub host: Option<String>,
}

/// A file may hold a single document or a list of them
#[derive(Deserialize)]
#[serde(untagged)]
enum DocumentSet {
    Many(Vec<ChannelRoutingDocument>),
    One(Box<ChannelRoutingDocument>),
}

impl From<DocumentSet> for Vec<ChannelRoutingDocument> {
    fn from(set: DocumentSet) -> Self {
        match set {
            DocumentSet::Many(docs) => docs,
            DocumentSet::One(doc) => vec![*doc],
        }
    }
}

/// Parse YAML (a JSON document is valid YAML too)
pub fn parse_yaml(text: &str) -> Result<Vec<ChannelRoutingDocument>> {
    let set: DocumentSet = serde_yml::from_str(text)
        .map_err(|e| RuntimeError::configuration(format!("invalid ChannelRouting YAML: {}", e)))?;
    Ok(set.into())
}

pub fn parse_json(text: &str) -> Result<Vec<ChannelRoutingDocument>> {
    let set: DocumentSet = serde_json::from_str(text)
        .map_err(|e| RuntimeError::configuration(format!("invalid ChannelRouting JSON: {}", e)))?;
    Ok(set.into())
}

/// Pick the parser from the file extension
pub fn parse_file_content(path: &Path, text: &str) -> Result<Vec<ChannelRoutingDocument>> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => parse_json(text),
        _ => parse_yaml(text),
    }
}

impl ChannelRoutingDocument {
    pub fn channel_id(&self) -> Option<&str> {
        self.label(LABEL_CHANNEL)
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.label(LABEL_TENANT)
    }

    pub fn subset(&self) -> Option<&str> {
        self.label(LABEL_SUBSET)
    }

    fn label(&self, key: &str) -> Option<&str> {
        self.metadata
            .labels
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    fn describe(&self) -> String {
        self.metadata
            .name
            .clone()
            .or_else(|| self.channel_id().map(str::to_string))
            .unwrap_or_else(|| "<unnamed>".to_string())
    }

    /// The channel this document routes, if it names a tenant
    pub fn channel(&self) -> Option<Channel> {
        let mut channel = Channel::new(self.channel_id()?, self.tenant_id()?);
        channel.display_name = self.metadata.name.clone();
        if let Some(subset) = self.subset() {
            channel.metadata.insert(LABEL_SUBSET.to_string(), subset.to_string());
        }
        Some(channel)
    }

    pub fn to_config(&self) -> Result<ChannelRoutingConfig> {
        let name = self.describe();
        if self.kind != CHANNEL_ROUTING_KIND {
            return Err(RuntimeError::configuration(format!(
                "document '{}' has kind '{}', expected {}",
                name, self.kind, CHANNEL_ROUTING_KIND
            )));
        }
        let channel_id = self.channel_id().ok_or_else(|| {
            RuntimeError::configuration(format!("document '{}' has no '{}' label", name, LABEL_CHANNEL))
        })?;
        if self.spec.capability_groups.is_empty() {
            return Err(RuntimeError::configuration(format!(
                "document '{}' lists no capability groups",
                name
            )));
        }

        let mode = match &self.spec.mode {
            Some(raw) => RoutingMode::from_string(raw).ok_or_else(|| {
                RuntimeError::configuration(format!(
                    "document '{}' has unknown routing mode '{}'",
                    name, raw
                ))
            })?,
            None if self.spec.capability_groups.len() == 1 => RoutingMode::Explicit,
            None => RoutingMode::Llm,
        };

        let mut agents: Vec<AgentDescriptor> = Vec::with_capacity(self.spec.capability_groups.len());
        for group in &self.spec.capability_groups {
            if agents.iter().any(|a| a.id == group.id) {
                return Err(RuntimeError::configuration(format!(
                    "document '{}' lists capability group '{}' twice",
                    name, group.id
                )));
            }
            let endpoint = group
                .host
                .as_deref()
                .or_else(|| group.capabilities.iter().find_map(|c| c.host.as_deref()))
                .filter(|h| !h.trim().is_empty())
                .ok_or_else(|| {
                    RuntimeError::configuration(format!(
                        "capability group '{}' in document '{}' has no host",
                        group.id, name
                    ))
                })?;

            let mut agent = AgentDescriptor::new(&group.id, endpoint.trim())
                .with_description(&group.description)
                .with_capabilities(group.capabilities.iter().map(|c| c.name.clone()));
            agent.name = group.name.clone();
            agents.push(agent);
        }

        Ok(ChannelRoutingConfig::new(channel_id, mode, agents))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
apiVersion: parley/v1
kind: ChannelRouting
metadata:
  name: acme-web
  labels:
    channel: web
    tenant: acme
spec:
  capabilityGroups:
    - id: sales
      description: Plans and pricing
      host: http://sales.local
      capabilities:
        - name: pricing
        - name: upgrade
    - id: support
      name: Support Desk
      capabilities:
        - name: outage
          host: http://support.local
"#;

    #[test]
    fn test_parse_single_yaml_document() {
        let docs = parse_yaml(SAMPLE).unwrap();
        assert_eq!(docs.len(), 1);
        let doc = &docs[0];
        assert_eq!(doc.channel_id(), Some("web"));
        assert_eq!(doc.tenant_id(), Some("acme"));
        assert_eq!(doc.subset(), None);

        let config = doc.to_config().unwrap();
        assert_eq!(config.channel_id, "web");
        assert_eq!(config.mode, RoutingMode::Llm);
        assert_eq!(config.agents[0].capabilities, vec!["pricing", "upgrade"]);
        assert_eq!(config.agents[1].endpoint, "http://support.local");
        assert_eq!(config.agents[1].display_name(), "Support Desk");
    }

    #[test]
    fn test_parse_json_list() {
        let json = r#"[
            {"kind": "ChannelRouting",
             "metadata": {"labels": {"channel": "c1", "tenant": "acme"}},
             "spec": {"capabilityGroups": [{"id": "billing", "host": "http://billing"}]}},
            {"kind": "ChannelRouting",
             "metadata": {"labels": {"channel": "c2", "tenant": "acme"}},
             "spec": {"mode": "explicit", "capabilityGroups": [
                {"id": "a", "host": "http://a"}, {"id": "b", "host": "http://b"}]}}
        ]"#;
        let docs = parse_json(json).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].to_config().unwrap().mode, RoutingMode::Explicit);
        let second = docs[1].to_config().unwrap();
        assert_eq!(second.mode, RoutingMode::Explicit);
        assert_eq!(second.agents.len(), 2);
    }

    #[test]
    fn test_group_without_host_is_rejected() {
        let yaml = r#"
kind: ChannelRouting
metadata:
  labels: {channel: web, tenant: acme}
spec:
  capabilityGroups:
    - id: ghost
      capabilities: [{name: haunting}]
"#;
        let err = parse_yaml(yaml).unwrap()[0].to_config().unwrap_err();
        assert_eq!(err.kind(), parley_core::ErrorKind::ConfigurationError);
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_wrong_kind_and_missing_channel() {
        let mut doc = parse_yaml(SAMPLE).unwrap().remove(0);
        doc.kind = "Channel".to_string();
        assert!(doc.to_config().is_err());

        let mut doc = parse_yaml(SAMPLE).unwrap().remove(0);
        doc.metadata.labels.remove("channel");
        assert!(doc.to_config().is_err());
        assert!(doc.channel().is_none());
    }

    #[test]
    fn test_unknown_mode() {
        let mut doc = parse_yaml(SAMPLE).unwrap().remove(0);
        doc.spec.mode = Some("ROUND_ROBIN".to_string());
        let err = doc.to_config().unwrap_err();
        assert!(err.to_string().contains("ROUND_ROBIN"));
    }

    #[test]
    fn test_channel_from_labels() {
        let yaml = SAMPLE.replace("tenant: acme", "tenant: acme\n    subset: canary");
        let doc = parse_yaml(&yaml).unwrap().remove(0);
        let channel = doc.channel().unwrap();
        assert_eq!(channel.id, "web");
        assert_eq!(channel.display_name.as_deref(), Some("acme-web"));
        assert_eq!(channel.metadata.get("subset").map(String::as_str), Some("canary"));
    }

    #[test]
    fn test_garbage_is_configuration_error() {
        let err = parse_json("{not json").unwrap_err();
        assert_eq!(err.kind(), parley_core::ErrorKind::ConfigurationError);
    }
}
