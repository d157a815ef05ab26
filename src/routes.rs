/*!
 * Relay routes: which subjects are consumed on one side and where they land
 * on the other.
 *
 * A route's name doubles as the name of its subscription in the source
 * side's registry. Destination subjects are a pure function of the route and
 * the received subject, so relaying never inspects the payload.
 */

use fedbroker_core_interface::{subject_matches, validate_subject};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Subject namespace all federation traffic for a cluster lives under
pub const FEDERATION_NAMESPACE: &str = "choria.federation";

/// One side of the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    /// The local network ordinary nodes live on
    Collective,
    /// The network joining several collectives
    Federation,
}

impl Side {
    pub const ALL: [Side; 2] = [Side::Collective, Side::Federation];

    pub fn opposite(&self) -> Side {
        match self {
            Side::Collective => Side::Federation,
            Side::Federation => Side::Collective,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Collective => "collective",
            Side::Federation => "federation",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a route picks its destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RouteTarget {
    /// Publish to the received subject with `prefix.` removed
    StripPrefix { prefix: String },
    /// Publish every message to one fixed subject
    Subject { subject: String },
    /// Hand every message to a named subscription's local delivery path
    QueueSub { name: String },
}

/// Where a single message goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Subject(String),
    QueueSub(String),
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Subject(subject) => f.write_str(subject),
            Destination::QueueSub(name) => write!(f, "queue:{}", name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Unique per source side; also the subscription name
    pub name: String,

    /// Side messages are consumed from
    pub source: Side,

    /// Subject pattern subscribed to on the source side
    pub subject: String,

    /// Queue group on the source side, empty for fan-out
    #[serde(default)]
    pub group: String,

    pub target: RouteTarget,
}

impl Route {
    /// Side messages are published to
    pub fn destination_side(&self) -> Side {
        self.source.opposite()
    }

    /// Compute the destination for a received subject
    ///
    /// Returns `None` when the subject cannot be mapped, e.g. it lacks the
    /// prefix a `StripPrefix` target expects.
    pub fn destination(&self, subject: &str) -> Option<Destination> {
        match &self.target {
            RouteTarget::StripPrefix { prefix } => subject
                .strip_prefix(prefix.as_str())
                .and_then(|rest| rest.strip_prefix('.'))
                .filter(|rest| !rest.is_empty())
                .map(|rest| Destination::Subject(rest.to_string())),
            RouteTarget::Subject { subject } => Some(Destination::Subject(subject.clone())),
            RouteTarget::QueueSub { name } => Some(Destination::QueueSub(name.clone())),
        }
    }

    /// True when a message on `subject` would be consumed by this route
    pub fn accepts(&self, subject: &str) -> bool {
        subject_matches(&self.subject, subject)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("route name must not be empty".to_string());
        }

        validate_subject(&self.subject)
            .map_err(|e| format!("route '{}': {}", self.name, e))?;

        if self.group.chars().any(char::is_whitespace) {
            return Err(format!("route '{}': invalid queue group '{}'", self.name, self.group));
        }

        match &self.target {
            RouteTarget::StripPrefix { prefix } => {
                validate_subject(prefix).map_err(|e| format!("route '{}': {}", self.name, e))?;
                if prefix.contains('*') || prefix.contains('>') {
                    return Err(format!(
                        "route '{}': prefix '{}' must not contain wildcards",
                        self.name, prefix
                    ));
                }
            }
            RouteTarget::Subject { subject } => {
                validate_subject(subject).map_err(|e| format!("route '{}': {}", self.name, e))?;
                if subject.contains('*') || subject.contains('>') {
                    return Err(format!(
                        "route '{}': target subject '{}' must not contain wildcards",
                        self.name, subject
                    ));
                }
            }
            RouteTarget::QueueSub { name } => {
                if name.trim().is_empty() {
                    return Err(format!("route '{}': queue target name is empty", self.name));
                }
            }
        }

        Ok(())
    }
}

/// Validate every route and require unique names
pub fn validate_routes(routes: &[Route]) -> Result<(), String> {
    let mut names = HashSet::new();
    for route in routes {
        route.validate()?;
        if !names.insert(route.name.as_str()) {
            return Err(format!("duplicate route name '{}'", route.name));
        }
    }
    Ok(())
}

/// `choria.federation.<cluster>.<side>`
pub fn federation_prefix(cluster: &str, side: Side) -> String {
    format!("{}.{}.{}", FEDERATION_NAMESPACE, cluster, side)
}

/// The two routes a cluster needs when no explicit routes are configured
///
/// Traffic a remote collective addresses to this cluster arrives on the
/// federation network under `choria.federation.<cluster>.federation.>` and is
/// delivered locally with the prefix removed. Replies local nodes send to
/// `choria.federation.<cluster>.collective.>` go out to the federation the
/// same way. Both are consumed in queue groups so several broker instances
/// can share the load.
pub fn default_routes(cluster: &str) -> Vec<Route> {
    // inbound requests first, then replies
    [Side::Federation, Side::Collective]
        .into_iter()
        .map(|source| {
            let prefix = federation_prefix(cluster, source);
            Route {
                name: format!("{}.{}", cluster, source),
                source,
                subject: format!("{}.>", prefix),
                group: format!("{}_{}", cluster, source),
                target: RouteTarget::StripPrefix { prefix },
            }
        })
        .collect()
}
