//! Public tunnel + base-URL discovery.
//!
//! When the dev server starts accepting connections, an optional tunnel is
//! requested for the bound port. Establishing it is slow and may finish long
//! after the UI has loaded, so the result is published through
//! [`EndpointPublisher`], which `GET /api/config` reads on every call.
//!
//! ```text
//!  Unpublished ──start()──▶ Publishing ──ok──▶ Published(url)
//!                                  └──────err──▶ Failed(reason)
//! ```
//!
//! `Failed` is terminal for the session: nothing is retried, and discovery
//! keeps answering with the local address.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::{TunnelConfig, TUNNEL_TOKEN_ENV};

/// An open tunnel. Dropping it closes the tunnel.
pub struct Tunnel {
    pub public_url: String,
    /// Agent process backing the tunnel, if any; killed on drop.
    _agent: Option<Child>,
}

impl Tunnel {
    pub fn new(public_url: impl Into<String>) -> Self {
        Self {
            public_url: public_url.into(),
            _agent: None,
        }
    }

    fn with_agent(public_url: String, agent: Child) -> Self {
        Self {
            public_url,
            _agent: Some(agent),
        }
    }
}

/// Something that can expose a local port under a public URL.
#[async_trait]
pub trait TunnelProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn open(&self, port: u16) -> Result<Tunnel>;
}

/// Publication state of the public endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishState {
    Unpublished,
    Publishing,
    Published(String),
    Failed(String),
}

/// Holds the best-known base URL for API consumers.
pub struct EndpointPublisher {
    local_port: u16,
    state: RwLock<PublishState>,
    tunnel: Mutex<Option<Tunnel>>,
}

impl EndpointPublisher {
    pub fn new(local_port: u16) -> Self {
        Self {
            local_port,
            state: RwLock::new(PublishState::Unpublished),
            tunnel: Mutex::new(None),
        }
    }

    pub fn state(&self) -> PublishState {
        self.state
            .read()
            .map(|s| s.clone())
            .unwrap_or(PublishState::Unpublished)
    }

    pub fn local_url(&self) -> String {
        format!("http://localhost:{}", self.local_port)
    }

    /// Tunnel URL once published, otherwise the local address.
    pub fn base_url(&self) -> String {
        match self.state() {
            PublishState::Published(url) => url,
            _ => self.local_url(),
        }
    }

    fn set_state(&self, next: PublishState) {
        if let Ok(mut state) = self.state.write() {
            *state = next;
        }
    }

    /// Moves `Unpublished → Publishing`; false if already past that.
    fn begin(&self) -> bool {
        match self.state.write() {
            Ok(mut state) if *state == PublishState::Unpublished => {
                *state = PublishState::Publishing;
                true
            }
            _ => false,
        }
    }

    /// Requests a tunnel for `port` in the background.
    ///
    /// Returns `None` without doing anything unless the publisher is still
    /// `Unpublished`.
    pub fn start(
        self: &Arc<Self>,
        provider: Arc<dyn TunnelProvider>,
        port: u16,
    ) -> Option<JoinHandle<()>> {
        if !self.begin() {
            return None;
        }
        let publisher = Arc::clone(self);
        Some(tokio::spawn(async move {
            publisher.establish(provider.as_ref(), port).await;
        }))
    }

    async fn establish(&self, provider: &dyn TunnelProvider, port: u16) {
        info!(provider = provider.name(), port, "requesting public tunnel");
        match provider.open(port).await {
            Ok(tunnel) => {
                info!(url = %tunnel.public_url, "public URL ready");
                self.set_state(PublishState::Published(tunnel.public_url.clone()));
                if let Ok(mut slot) = self.tunnel.lock() {
                    *slot = Some(tunnel);
                }
            }
            Err(e) => {
                error!(provider = provider.name(), error = %format!("{:#}", e), "tunnel failed to start; serving locally only");
                self.set_state(PublishState::Failed(e.to_string()));
            }
        }
    }
}

// ============ ngrok agent ============

/// Runs the `ngrok` agent as a child process and reads the public URL from
/// the agent's local inspection API.
pub struct NgrokAgent {
    binary: String,
    authtoken: String,
    agent_api: String,
    startup_timeout: Duration,
    http: reqwest::Client,
}

impl NgrokAgent {
    pub fn new(config: &TunnelConfig, authtoken: String) -> Self {
        Self {
            binary: config.binary.clone(),
            authtoken,
            agent_api: config.agent_api.trim_end_matches('/').to_string(),
            startup_timeout: Duration::from_secs(config.startup_timeout_secs),
            http: reqwest::Client::new(),
        }
    }

    /// The agent invocation. The credential travels in the child's
    /// environment so it never shows up in the process list.
    fn agent_command(&self, port: u16) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("http")
            .arg(port.to_string())
            .env(TUNNEL_TOKEN_ENV, &self.authtoken)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    async fn poll_public_url(&self, agent: &mut Child, port: u16) -> Result<String> {
        let url = format!("{}/api/tunnels", self.agent_api);
        let deadline = tokio::time::Instant::now() + self.startup_timeout;

        loop {
            if let Some(status) = agent.try_wait()? {
                bail!("ngrok agent exited early with {}", status);
            }
            if let Ok(resp) = self.http.get(&url).send().await {
                if resp.status().is_success() {
                    if let Ok(list) = resp.json::<AgentTunnels>().await {
                        if let Some(public) = list.best_url(port) {
                            return Ok(public);
                        }
                    }
                }
            }
            if tokio::time::Instant::now() >= deadline {
                bail!(
                    "no tunnel reported by {} within {}s",
                    url,
                    self.startup_timeout.as_secs()
                );
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }
}

#[derive(Debug, Deserialize)]
struct AgentTunnels {
    #[serde(default)]
    tunnels: Vec<AgentTunnel>,
}

#[derive(Debug, Deserialize)]
struct AgentTunnel {
    public_url: String,
    #[serde(default)]
    config: Option<AgentTunnelConfig>,
}

#[derive(Debug, Deserialize)]
struct AgentTunnelConfig {
    #[serde(default)]
    addr: String,
}

impl AgentTunnel {
    /// True when this tunnel forwards to local `port`. The agent API may be
    /// shared with tunnels for other services.
    fn forwards_to(&self, port: u16) -> bool {
        self.config
            .as_ref()
            .map(|c| c.addr.trim_end_matches('/').ends_with(&format!(":{}", port)))
            .unwrap_or(false)
    }
}

impl AgentTunnels {
    /// A tunnel for `port`, preferring https when the agent reports several.
    fn best_url(&self, port: u16) -> Option<String> {
        let ours: Vec<_> = self.tunnels.iter().filter(|t| t.forwards_to(port)).collect();
        ours.iter()
            .find(|t| t.public_url.starts_with("https://"))
            .or_else(|| ours.first())
            .map(|t| t.public_url.clone())
    }
}

#[async_trait]
impl TunnelProvider for NgrokAgent {
    fn name(&self) -> &str {
        "ngrok"
    }

    async fn open(&self, port: u16) -> Result<Tunnel> {
        let mut agent = self
            .agent_command(port)
            .spawn()
            .with_context(|| format!("Failed to launch tunnel agent '{}'", self.binary))?;

        let public_url = self
            .poll_public_url(&mut agent, port)
            .await
            .map_err(|e| anyhow!("ngrok tunnel for port {} not established: {}", port, e))?;
        Ok(Tunnel::with_agent(public_url, agent))
    }
}

/// The provider to use for this configuration, if tunneling is enabled.
pub fn provider_from_config(
    config: &TunnelConfig,
    env_token: Option<String>,
) -> Option<Arc<dyn TunnelProvider>> {
    config
        .resolve_token(env_token)
        .map(|token| Arc::new(NgrokAgent::new(config, token)) as Arc<dyn TunnelProvider>)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    struct FixedTunnel(&'static str);

    #[async_trait]
    impl TunnelProvider for FixedTunnel {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn open(&self, _port: u16) -> Result<Tunnel> {
            Ok(Tunnel::new(self.0))
        }
    }

    struct BrokenTunnel;

    #[async_trait]
    impl TunnelProvider for BrokenTunnel {
        fn name(&self) -> &str {
            "broken"
        }

        async fn open(&self, _port: u16) -> Result<Tunnel> {
            bail!("credential rejected")
        }
    }

    struct GatedTunnel(Mutex<Option<oneshot::Receiver<()>>>);

    #[async_trait]
    impl TunnelProvider for GatedTunnel {
        fn name(&self) -> &str {
            "gated"
        }

        async fn open(&self, _port: u16) -> Result<Tunnel> {
            let gate = self.0.lock().unwrap().take();
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            Ok(Tunnel::new("https://late.example"))
        }
    }

    #[test]
    fn test_unpublished_uses_local_address() {
        let publisher = EndpointPublisher::new(5173);
        assert_eq!(publisher.state(), PublishState::Unpublished);
        assert_eq!(publisher.base_url(), "http://localhost:5173");
    }

    #[tokio::test]
    async fn test_published_uses_tunnel_url() {
        let publisher = Arc::new(EndpointPublisher::new(5173));
        let handle = publisher
            .start(Arc::new(FixedTunnel("https://abc.ngrok.app")), 5173)
            .unwrap();
        handle.await.unwrap();
        assert_eq!(
            publisher.state(),
            PublishState::Published("https://abc.ngrok.app".into())
        );
        assert_eq!(publisher.base_url(), "https://abc.ngrok.app");
    }

    #[tokio::test]
    async fn test_failure_is_terminal_and_falls_back() {
        let publisher = Arc::new(EndpointPublisher::new(4000));
        publisher
            .start(Arc::new(BrokenTunnel), 4000)
            .unwrap()
            .await
            .unwrap();
        assert!(matches!(publisher.state(), PublishState::Failed(_)));
        assert_eq!(publisher.base_url(), "http://localhost:4000");

        // No retry once failed.
        assert!(publisher
            .start(Arc::new(FixedTunnel("https://x.example")), 4000)
            .is_none());
    }

    #[tokio::test]
    async fn test_publishing_serves_local_until_ready() {
        let (tx, rx) = oneshot::channel();
        let publisher = Arc::new(EndpointPublisher::new(5173));
        let handle = publisher
            .start(Arc::new(GatedTunnel(Mutex::new(Some(rx)))), 5173)
            .unwrap();

        assert_eq!(publisher.state(), PublishState::Publishing);
        assert_eq!(publisher.base_url(), "http://localhost:5173");
        assert!(publisher
            .start(Arc::new(FixedTunnel("https://other.example")), 5173)
            .is_none());

        tx.send(()).unwrap();
        handle.await.unwrap();
        assert_eq!(publisher.base_url(), "https://late.example");
    }

    #[test]
    fn test_agent_tunnels_prefers_https() {
        let list: AgentTunnels = serde_json::from_str(
            r#"{"tunnels":[
                {"public_url":"http://a.ngrok.io","proto":"http","config":{"addr":"http://localhost:5173"}},
                {"public_url":"https://a.ngrok.io","proto":"https","config":{"addr":"http://localhost:5173"}}
            ]}"#,
        )
        .unwrap();
        assert_eq!(list.best_url(5173).as_deref(), Some("https://a.ngrok.io"));

        let empty: AgentTunnels = serde_json::from_str(r#"{"tunnels":[]}"#).unwrap();
        assert!(empty.best_url(5173).is_none());
    }

    #[test]
    fn test_agent_tunnels_ignore_other_ports() {
        let list: AgentTunnels = serde_json::from_str(
            r#"{"tunnels":[
                {"public_url":"https://other.ngrok.io","config":{"addr":"http://localhost:3000"}},
                {"public_url":"https://stale.ngrok.io","config":{"addr":"http://localhost:51730"}},
                {"public_url":"https://noaddr.ngrok.io"},
                {"public_url":"http://ours.ngrok.io","config":{"addr":"localhost:5173"}}
            ]}"#,
        )
        .unwrap();
        assert_eq!(list.best_url(5173).as_deref(), Some("http://ours.ngrok.io"));
        assert!(list.best_url(8080).is_none());
    }

    #[test]
    fn test_agent_token_not_on_command_line() {
        let agent = NgrokAgent::new(&TunnelConfig::default(), "s3cret".into());
        let cmd = agent.agent_command(5173);
        let std_cmd = cmd.as_std();

        let args: Vec<_> = std_cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args, vec!["http", "5173"]);

        let token = std_cmd
            .get_envs()
            .find(|(k, _)| *k == TUNNEL_TOKEN_ENV)
            .and_then(|(_, v)| v);
        assert_eq!(token.map(|v| v.to_string_lossy().into_owned()).as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_provider_only_with_credential() {
        let cfg = TunnelConfig::default();
        assert!(provider_from_config(&cfg, None).is_none());
        let provider = provider_from_config(&cfg, Some("tok".into())).unwrap();
        assert_eq!(provider.name(), "ngrok");
    }

    #[tokio::test]
    async fn test_missing_agent_binary_fails() {
        let cfg = TunnelConfig {
            binary: "/nonexistent/ngrok-agent".into(),
            startup_timeout_secs: 1,
            ..TunnelConfig::default()
        };
        let agent = NgrokAgent::new(&cfg, "tok".into());
        assert!(agent.open(5173).await.is_err());
    }
}
