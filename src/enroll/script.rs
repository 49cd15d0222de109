//! Templated setup script served to enrolling nodes.
//!
//! The script is public: it is useless without a valid setup code. Every
//! value interpolated into it is validated against a strict allow-list
//! pattern first, so no caller-controlled byte reaches the shell unchecked.

use std::sync::LazyLock;

use regex::Regex;

use crate::persist::nodes::NodeKind;
use crate::{Error, Result};

static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^https?://[A-Za-z0-9._:/\[\]-]+$").expect("static regex"));
static CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-f0-9]{32}$").expect("static regex"));
static HOST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._:\[\]-]*$").expect("static regex"));

/// Inputs for the rendered script.
#[derive(Debug)]
pub struct ScriptParams<'a> {
    /// Node kind the script provisions
    pub kind: NodeKind,
    /// Base URL the node will call back to
    pub pulse_url: &'a str,
    /// Setup code embedded in the auto-register call
    pub setup_code: &'a str,
    /// Target host the admin named, if any
    pub host: &'a str,
}

/// Validate inputs and render the install script.
pub fn render_setup_script(params: &ScriptParams<'_>) -> Result<String> {
    if !URL_RE.is_match(params.pulse_url) {
        return Err(Error::validation("invalid_url", "pulse_url is not acceptable"));
    }
    if !CODE_RE.is_match(params.setup_code) {
        return Err(Error::validation("invalid_token", "setup token is not acceptable"));
    }
    if !HOST_RE.is_match(params.host) {
        return Err(Error::validation("invalid_host", "host is not acceptable"));
    }

    let body = match params.kind {
        NodeKind::Pve => PVE_PROVISION,
        NodeKind::Pbs => PBS_PROVISION,
    };

    Ok(format!(
        r#"#!/bin/sh
# Pulse monitoring setup - creates a read-only monitoring user and API token
# on this node, then registers it with Pulse.
set -eu

PULSE_URL="{pulse_url}"
SETUP_CODE="{setup_code}"
NODE_TYPE="{node_type}"
TARGET_HOST="{host}"

MONITOR_USER="pulse-monitor"
TOKEN_NAME="pulse"

fail() {{
    echo "pulse-setup: $1" >&2
    exit 1
}}

command -v curl >/dev/null 2>&1 || fail "curl is required"

if [ -z "$TARGET_HOST" ]; then
    TARGET_HOST="$(hostname -I 2>/dev/null | awk '{{print $1}}')"
    [ -n "$TARGET_HOST" ] || fail "could not determine this host's address"
fi

{body}

echo "Registering with Pulse at $PULSE_URL ..."
HTTP_CODE="$(curl -sk -o /tmp/pulse-register.out -w '%{{http_code}}' \
    -X POST "$PULSE_URL/api/auto-register" \
    -H 'Content-Type: application/json' \
    -H "X-Setup-Token: $SETUP_CODE" \
    -d "{{\"type\":\"$NODE_TYPE\",\"host\":\"$TARGET_HOST\",\"serverName\":\"$(hostname)\",\"tokenId\":\"$TOKEN_ID\",\"tokenValue\":\"$TOKEN_SECRET\",\"source\":\"script\"}}")"

if [ "$HTTP_CODE" != "200" ]; then
    cat /tmp/pulse-register.out >&2 || true
    fail "registration failed with HTTP $HTTP_CODE"
fi

echo "Node registered with Pulse."
"#,
        pulse_url = params.pulse_url,
        setup_code = params.setup_code,
        node_type = params.kind,
        host = params.host,
    ))
}

const PVE_PROVISION: &str = r#"command -v pveum >/dev/null 2>&1 || fail "pveum not found - is this a Proxmox VE node?"

if ! pveum user list | grep -q "$MONITOR_USER@pam"; then
    pveum user add "$MONITOR_USER@pam" --comment "Pulse monitoring (auto-created)"
fi
pveum acl modify / --users "$MONITOR_USER@pam" --roles PVEAuditor

TOKEN_ID="$MONITOR_USER@pam!$TOKEN_NAME"
pveum user token remove "$MONITOR_USER@pam" "$TOKEN_NAME" >/dev/null 2>&1 || true
TOKEN_SECRET="$(pveum user token add "$MONITOR_USER@pam" "$TOKEN_NAME" --privsep 0 --output-format json \
    | sed -n 's/.*"value"[^"]*"\([^"]*\)".*/\1/p')"
[ -n "$TOKEN_SECRET" ] || fail "token creation did not return a secret""#;

const PBS_PROVISION: &str = r#"command -v proxmox-backup-manager >/dev/null 2>&1 || fail "proxmox-backup-manager not found - is this a Proxmox Backup Server?"

if ! proxmox-backup-manager user list --output-format json | grep -q "$MONITOR_USER@pbs"; then
    proxmox-backup-manager user create "$MONITOR_USER@pbs"
fi
proxmox-backup-manager acl update / Audit --auth-id "$MONITOR_USER@pbs"

TOKEN_ID="$MONITOR_USER@pbs!$TOKEN_NAME"
proxmox-backup-manager user delete-token "$MONITOR_USER@pbs" "$TOKEN_NAME" >/dev/null 2>&1 || true
TOKEN_SECRET="$(proxmox-backup-manager user generate-token "$MONITOR_USER@pbs" "$TOKEN_NAME" --output-format json \
    | sed -n 's/.*"value"[^"]*"\([^"]*\)".*/\1/p')"
[ -n "$TOKEN_SECRET" ] || fail "token creation did not return a secret""#;
