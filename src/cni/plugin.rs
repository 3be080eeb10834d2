//! CNI command execution: env + stdin → daemon RPC → stdout JSON.
//!
//! The shim binary is a thin wrapper around [`run`]. Teardown (`DEL`) is
//! idempotent per the CNI contract: it exits 0 even when the config is
//! unparseable or the daemon has no record of the address.

use std::collections::BTreeMap;
use std::io::Read;

use tracing::debug;

use crate::cni::{
    error_code, CniError, CniResult, IpConfig, NetConf, Route, VersionResult, CNI_VERSION_040,
    CNI_VERSION_100,
};
use crate::server::{ServiceClient, ServiceErrorKind, ServiceRequest, ServiceResponse};

const ENV_COMMAND: &str = "CNI_COMMAND";
const ENV_CONTAINER_ID: &str = "CNI_CONTAINERID";
const ENV_NETNS: &str = "CNI_NETNS";
const ENV_IFNAME: &str = "CNI_IFNAME";

const DEFAULT_DAEMON_SOCKET: &str = "/run/tamarack/ipam.sock";

/// Outcome of one plugin invocation: what to print, and the exit code.
#[derive(Debug, PartialEq, Eq)]
pub struct PluginOutput {
    pub stdout: String,
    pub exit_code: i32,
}

impl PluginOutput {
    fn success(stdout: String) -> Self {
        Self { stdout, exit_code: 0 }
    }

    fn failure(err: CniError) -> Self {
        Self {
            stdout: serde_json::to_string(&err).unwrap_or_else(|_| err.to_string()),
            exit_code: 1,
        }
    }

    fn silent_success() -> Self {
        Self {
            stdout: String::new(),
            exit_code: 0,
        }
    }
}

/// Execute the CNI command named by the environment.
///
/// `env` is passed in (rather than read from `std::env`) so tests can
/// drive the full dispatch; the shim binary collects the real process
/// environment and stdin.
pub async fn run(env: &BTreeMap<String, String>, stdin: &str) -> PluginOutput {
    let Some(command) = env.get(ENV_COMMAND).filter(|c| !c.is_empty()) else {
        return PluginOutput::failure(CniError::new(
            error_code::INVALID_ENV_VAR,
            "CNI_COMMAND not set",
            "",
        ));
    };

    match command.as_str() {
        "ADD" => handle_add(env, stdin).await,
        "DEL" => handle_del(env, stdin).await,
        "CHECK" => handle_check(env, stdin).await,
        "VERSION" => handle_version(),
        other => PluginOutput::failure(CniError::new(
            error_code::INVALID_ENV_VAR,
            "unknown command",
            other,
        )),
    }
}

/// Read the whole of stdin for the shim binary.
pub fn read_stdin() -> std::io::Result<String> {
    let mut buffer = String::new();
    std::io::stdin().read_to_string(&mut buffer)?;
    Ok(buffer)
}

fn load_net_conf(stdin: &str) -> Result<NetConf, CniError> {
    let conf: NetConf = serde_json::from_str(stdin).map_err(|err| {
        CniError::new(
            error_code::DECODING_FAILURE,
            "failed to load network config",
            err.to_string(),
        )
    })?;
    if conf.cni_version != CNI_VERSION_040 && conf.cni_version != CNI_VERSION_100 {
        return Err(CniError::new(
            error_code::INCOMPATIBLE_VERSION,
            "unsupported cniVersion",
            conf.cni_version,
        ));
    }
    Ok(conf)
}

fn daemon_client(conf: &NetConf) -> ServiceClient {
    let socket = conf
        .ipam
        .as_ref()
        .and_then(|ipam| ipam.daemon_socket.clone())
        .unwrap_or_else(|| DEFAULT_DAEMON_SOCKET.to_string());
    ServiceClient::unix(socket)
}

fn node_id() -> String {
    std::env::var("IPAM_NODE_NAME")
        .ok()
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|s| s.trim().to_string())
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

async fn handle_add(env: &BTreeMap<String, String>, stdin: &str) -> PluginOutput {
    let conf = match load_net_conf(stdin) {
        Ok(conf) => conf,
        Err(err) => return PluginOutput::failure(err),
    };

    let container_id = env.get(ENV_CONTAINER_ID).cloned().unwrap_or_default();
    let netns = env.get(ENV_NETNS).cloned().unwrap_or_default();
    let ifname = env.get(ENV_IFNAME).cloned().unwrap_or_default();
    if container_id.is_empty() || netns.is_empty() || ifname.is_empty() {
        return PluginOutput::failure(CniError::new(
            error_code::INVALID_ENV_VAR,
            "missing required env vars",
            "CNI_CONTAINERID, CNI_NETNS and CNI_IFNAME are required for ADD",
        ));
    }

    let (pod_namespace, pod_name) = pod_identity(env);
    let client = daemon_client(&conf);
    let request = ServiceRequest::AllocateIp {
        node_id: node_id(),
        pod_name,
        pod_namespace,
        container_id,
        purpose: None,
    };

    let response = match client.request(request).await {
        Ok(response) => response,
        Err(err) => {
            return PluginOutput::failure(CniError::new(
                error_code::IO_FAILURE,
                "failed to reach IPAM daemon",
                err.to_string(),
            ));
        }
    };

    match response {
        ServiceResponse::IpAllocated {
            cidr,
            gateway,
            routes,
            ..
        } => {
            let mut result_routes: Vec<Route> = routes
                .into_iter()
                .map(|r| Route { dst: r.dst, gw: r.gw })
                .collect();
            if let Some(extra) = conf.ipam.as_ref().map(|ipam| ipam.routes.clone()) {
                result_routes.extend(extra);
            }

            let result = CniResult {
                cni_version: conf.cni_version.clone(),
                ips: vec![IpConfig {
                    address: cidr,
                    gateway: Some(gateway),
                }],
                routes: result_routes,
            };
            match serde_json::to_string_pretty(&result) {
                Ok(body) => PluginOutput::success(body),
                Err(err) => PluginOutput::failure(CniError::new(
                    error_code::INTERNAL,
                    "failed to print result",
                    err.to_string(),
                )),
            }
        }
        ServiceResponse::Error { kind, message } => {
            PluginOutput::failure(service_error_to_cni(kind, message))
        }
        other => PluginOutput::failure(CniError::new(
            error_code::INTERNAL,
            "unexpected daemon response",
            format!("{other:?}"),
        )),
    }
}

async fn handle_del(env: &BTreeMap<String, String>, stdin: &str) -> PluginOutput {
    // Idempotent teardown: any parse or lookup failure still exits 0.
    let Ok(conf) = load_net_conf(stdin) else {
        return PluginOutput::silent_success();
    };
    let Some(container_id) = env.get(ENV_CONTAINER_ID).filter(|c| !c.is_empty()) else {
        return PluginOutput::silent_success();
    };

    let client = daemon_client(&conf);
    debug!(container_id = %container_id, "releasing address on DEL");

    // The daemon resolves the address from its container mapping when the
    // ip field is empty; no record means nothing to release.
    let _ = client
        .request(ServiceRequest::ReleaseIp {
            node_id: node_id(),
            ip: String::new(),
            container_id: Some(container_id.clone()),
        })
        .await;

    PluginOutput::silent_success()
}

async fn handle_check(env: &BTreeMap<String, String>, stdin: &str) -> PluginOutput {
    let conf = match load_net_conf(stdin) {
        Ok(conf) => conf,
        Err(err) => return PluginOutput::failure(err),
    };
    let Some(container_id) = env.get(ENV_CONTAINER_ID).filter(|c| !c.is_empty()) else {
        return PluginOutput::failure(CniError::new(
            error_code::INVALID_ENV_VAR,
            "missing CNI_CONTAINERID",
            "",
        ));
    };

    // CHECK validates that the daemon is reachable and the container is
    // known. An unreachable daemon is a soft failure (try again later).
    let client = daemon_client(&conf);
    match client.request(ServiceRequest::GetHealth).await {
        Ok(_) => PluginOutput::silent_success(),
        Err(err) => PluginOutput::failure(CniError::new(
            error_code::TRY_AGAIN_LATER,
            format!("IPAM daemon unreachable for container {container_id}"),
            err.to_string(),
        )),
    }
}

fn handle_version() -> PluginOutput {
    match serde_json::to_string_pretty(&VersionResult::default()) {
        Ok(body) => PluginOutput::success(body),
        Err(err) => PluginOutput::failure(CniError::new(
            error_code::INTERNAL,
            "failed to print version",
            err.to_string(),
        )),
    }
}

/// `CNI_ARGS` carries `K8S_POD_NAMESPACE=...;K8S_POD_NAME=...` from the
/// kubelet; absent entries default to empty strings.
fn pod_identity(env: &BTreeMap<String, String>) -> (String, String) {
    let args = env.get("CNI_ARGS").cloned().unwrap_or_default();
    let mut namespace = String::new();
    let mut name = String::new();
    for pair in args.split(';') {
        if let Some((key, value)) = pair.split_once('=') {
            match key {
                "K8S_POD_NAMESPACE" => namespace = value.to_string(),
                "K8S_POD_NAME" => name = value.to_string(),
                _ => {}
            }
        }
    }
    (namespace, name)
}

fn service_error_to_cni(kind: ServiceErrorKind, message: String) -> CniError {
    match kind {
        ServiceErrorKind::NotLeader { .. }
        | ServiceErrorKind::Timeout
        | ServiceErrorKind::ConsensusUnavailable => {
            CniError::new(error_code::TRY_AGAIN_LATER, "IPAM cluster unavailable", message)
        }
        ServiceErrorKind::InvalidRequest => {
            CniError::new(error_code::INVALID_NETWORK_CONFIG, "invalid request", message)
        }
        ServiceErrorKind::CommandFailed | ServiceErrorKind::Internal => {
            CniError::new(error_code::INTERNAL, "failed to allocate IP", message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn missing_command_is_env_error() {
        let out = run(&BTreeMap::new(), "").await;
        assert_eq!(out.exit_code, 1);
        let err: CniError = serde_json::from_str(&out.stdout).unwrap();
        assert_eq!(err.code, error_code::INVALID_ENV_VAR);
    }

    #[tokio::test]
    async fn unknown_command_is_env_error() {
        let out = run(&env(&[("CNI_COMMAND", "FROB")]), "").await;
        assert_eq!(out.exit_code, 1);
        let err: CniError = serde_json::from_str(&out.stdout).unwrap();
        assert_eq!(err.code, error_code::INVALID_ENV_VAR);
        assert_eq!(err.details, "FROB");
    }

    #[tokio::test]
    async fn version_lists_supported_versions() {
        let out = run(&env(&[("CNI_COMMAND", "VERSION")]), "").await;
        assert_eq!(out.exit_code, 0);
        let result: VersionResult = serde_json::from_str(&out.stdout).unwrap();
        assert!(result.supported_versions.contains(&CNI_VERSION_040.to_string()));
        assert!(result.supported_versions.contains(&CNI_VERSION_100.to_string()));
    }

    #[tokio::test]
    async fn add_with_bad_config_is_decode_error() {
        let out = run(
            &env(&[
                ("CNI_COMMAND", "ADD"),
                ("CNI_CONTAINERID", "ctr-1"),
                ("CNI_NETNS", "/proc/1/ns/net"),
                ("CNI_IFNAME", "eth0"),
            ]),
            "{not json",
        )
        .await;
        assert_eq!(out.exit_code, 1);
        let err: CniError = serde_json::from_str(&out.stdout).unwrap();
        assert_eq!(err.code, error_code::DECODING_FAILURE);
    }

    #[tokio::test]
    async fn add_rejects_unsupported_version() {
        let out = run(
            &env(&[
                ("CNI_COMMAND", "ADD"),
                ("CNI_CONTAINERID", "ctr-1"),
                ("CNI_NETNS", "/proc/1/ns/net"),
                ("CNI_IFNAME", "eth0"),
            ]),
            r#"{"cniVersion": "0.1.0", "name": "net", "type": "tamarack"}"#,
        )
        .await;
        assert_eq!(out.exit_code, 1);
        let err: CniError = serde_json::from_str(&out.stdout).unwrap();
        assert_eq!(err.code, error_code::INCOMPATIBLE_VERSION);
    }

    #[tokio::test]
    async fn add_without_container_env_is_env_error() {
        let out = run(
            &env(&[("CNI_COMMAND", "ADD")]),
            r#"{"cniVersion": "0.4.0", "name": "net", "type": "tamarack"}"#,
        )
        .await;
        assert_eq!(out.exit_code, 1);
        let err: CniError = serde_json::from_str(&out.stdout).unwrap();
        assert_eq!(err.code, error_code::INVALID_ENV_VAR);
    }

    #[tokio::test]
    async fn del_with_unparseable_config_exits_zero() {
        let out = run(&env(&[("CNI_COMMAND", "DEL")]), "{not json").await;
        assert_eq!(out.exit_code, 0);
        assert!(out.stdout.is_empty());
    }

    #[tokio::test]
    async fn del_without_container_id_exits_zero() {
        let out = run(
            &env(&[("CNI_COMMAND", "DEL")]),
            r#"{"cniVersion": "0.4.0", "name": "net", "type": "tamarack"}"#,
        )
        .await;
        assert_eq!(out.exit_code, 0);
    }

    #[test]
    fn pod_identity_parses_kubelet_args() {
        let e = env(&[("CNI_ARGS", "IgnoreUnknown=1;K8S_POD_NAMESPACE=prod;K8S_POD_NAME=web-0")]);
        let (namespace, name) = pod_identity(&e);
        assert_eq!(namespace, "prod");
        assert_eq!(name, "web-0");
    }
}
