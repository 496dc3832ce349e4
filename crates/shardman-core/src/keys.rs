//! etcd key layout.
//!
//! All durable state lives under a configurable root prefix. The layout is
//! split between the SM service's own subtree (specs, leader key) and each
//! application service's subtree (heartbeats, task queue).

/// Computes the etcd paths used by shardman.
///
/// Bound to one SM service; application services are passed per call since a
/// single SM cluster manages many of them.
#[derive(Debug, Clone)]
pub struct NodeManager {
    prefix: String,
    sm_service: String,
}

impl NodeManager {
    pub fn new(prefix: impl Into<String>, sm_service: impl Into<String>) -> Self {
        let mut prefix = prefix.into();
        while prefix.ends_with('/') {
            prefix.pop();
        }
        Self {
            prefix,
            sm_service: sm_service.into(),
        }
    }

    pub fn sm_service(&self) -> &str {
        &self.sm_service
    }

    /// `<prefix>/app/<service>`
    pub fn app(&self, service: &str) -> String {
        format!("{}/app/{}", self.prefix, service)
    }

    /// `<prefix>/app/<smService>`
    pub fn sm_root(&self) -> String {
        self.app(&self.sm_service)
    }

    /// `<prefix>/app/<smService>/leader`
    pub fn leader(&self) -> String {
        format!("{}/leader", self.sm_root())
    }

    /// `<prefix>/app/<smService>/service/` — prefix listing every managed
    /// service subtree.
    pub fn service_root(&self) -> String {
        format!("{}/service/", self.sm_root())
    }

    /// `<prefix>/app/<smService>/service/<service>/` — the spec and shard
    /// subtree of one managed service.
    pub fn service_subtree(&self, service: &str) -> String {
        format!("{}{}/", self.service_root(), service)
    }

    /// `<prefix>/app/<smService>/service/<service>/spec`
    pub fn service_spec(&self, service: &str) -> String {
        format!("{}{}/spec", self.service_root(), service)
    }

    /// `<prefix>/app/<smService>/service/<service>/shard/`
    pub fn shard_root(&self, service: &str) -> String {
        format!("{}{}/shard/", self.service_root(), service)
    }

    /// `<prefix>/app/<smService>/service/<service>/shard/<shardId>`
    pub fn shard_spec(&self, service: &str, shard_id: &str) -> String {
        format!("{}{}", self.shard_root(service), shard_id)
    }

    /// `<prefix>/app/<service>/containerhb/`
    pub fn container_hb_root(&self, service: &str) -> String {
        format!("{}/containerhb/", self.app(service))
    }

    /// `<prefix>/app/<service>/containerhb/<containerId>`
    pub fn container_hb(&self, service: &str, container_id: &str) -> String {
        format!("{}{}", self.container_hb_root(service), container_id)
    }

    /// `<prefix>/app/<service>/shardhb/`
    pub fn shard_hb_root(&self, service: &str) -> String {
        format!("{}/shardhb/", self.app(service))
    }

    /// `<prefix>/app/<service>/shardhb/<shardId>`
    pub fn shard_hb(&self, service: &str, shard_id: &str) -> String {
        format!("{}{}", self.shard_hb_root(service), shard_id)
    }

    /// `<prefix>/app/<service>/task` — single key holding the latest move
    /// action list for the service.
    pub fn task(&self, service: &str) -> String {
        format!("{}/task", self.app(service))
    }

    /// Extracts the service name from a key under [`Self::service_root`],
    /// returning it only for `spec` keys.
    pub fn service_of_spec_key<'a>(&self, key: &'a str) -> Option<&'a str> {
        let rest = key.strip_prefix(&self.service_root())?;
        rest.strip_suffix("/spec")
            .filter(|svc| !svc.is_empty() && !svc.contains('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nm() -> NodeManager {
        NodeManager::new("/sm", "foo.bar")
    }

    #[test]
    fn layout_matches_wire_format() {
        let nm = nm();
        assert_eq!(nm.sm_root(), "/sm/app/foo.bar");
        assert_eq!(nm.leader(), "/sm/app/foo.bar/leader");
        assert_eq!(
            nm.service_spec("proxy.dev"),
            "/sm/app/foo.bar/service/proxy.dev/spec"
        );
        assert_eq!(
            nm.shard_spec("proxy.dev", "s1"),
            "/sm/app/foo.bar/service/proxy.dev/shard/s1"
        );
        assert_eq!(
            nm.container_hb("proxy.dev", "c1"),
            "/sm/app/proxy.dev/containerhb/c1"
        );
        assert_eq!(nm.shard_hb_root("proxy.dev"), "/sm/app/proxy.dev/shardhb/");
        assert_eq!(nm.task("proxy.dev"), "/sm/app/proxy.dev/task");
        assert_eq!(
            nm.service_subtree("proxy.dev"),
            "/sm/app/foo.bar/service/proxy.dev/"
        );
    }

    #[test]
    fn trailing_slash_in_prefix_is_normalized() {
        let nm = NodeManager::new("/sm/", "foo.bar");
        assert_eq!(nm.sm_root(), "/sm/app/foo.bar");
    }

    #[test]
    fn spec_key_parsing() {
        let nm = nm();
        assert_eq!(
            nm.service_of_spec_key("/sm/app/foo.bar/service/proxy.dev/spec"),
            Some("proxy.dev")
        );
        // Shard keys under the same subtree are not spec keys.
        assert_eq!(
            nm.service_of_spec_key("/sm/app/foo.bar/service/proxy.dev/shard/s1"),
            None
        );
        assert_eq!(nm.service_of_spec_key("/sm/app/other/leader"), None);
    }
}
