// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of forsvar

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use forsvar_common::models::Challenge;
use std::collections::BTreeMap;

/// The variable that receives the flag if the challenge doesn't name any
pub const DEFAULT_FLAG_ENV: &str = "FLAG";
/// Naming this variable passes the flag as the container's argument instead
pub const FLAG_ARGUMENT_PLACEHOLDER: &str = "ARGV";
/// The variable that receives the per-instance access secret
pub const CREDENTIAL_ENV: &str = "SSH_PASSWORD";

#[derive(Debug, Default, PartialEq)]
pub(crate) struct FlagInjection {
    pub env: BTreeMap<String, String>,
    pub args: Vec<String>,
}

pub(crate) fn flag_injection(challenge: &Challenge, flag: &str) -> FlagInjection {
    let mut injection = FlagInjection::default();
    if challenge.flag_env.is_empty() {
        injection
            .env
            .insert(DEFAULT_FLAG_ENV.to_string(), flag.to_string());
        return injection;
    }

    for name in &challenge.flag_env {
        if name == FLAG_ARGUMENT_PLACEHOLDER {
            if injection.args.is_empty() {
                injection.args.push(flag.to_string());
            }
        } else {
            injection.env.insert(name.clone(), flag.to_string());
        }
    }
    injection
}

/// The challenge's static flag, or a random one
pub(crate) fn generate_flag(challenge: &Challenge) -> String {
    if let Some(flag) = &challenge.flag {
        return flag.clone();
    }
    let bytes: [u8; 16] = rand::random();
    let hex: String = bytes.iter().map(|byte| format!("{byte:02x}")).collect();
    format!("flag{{{hex}}}")
}

pub(crate) fn generate_credential() -> String {
    let bytes: [u8; 24] = rand::random();
    URL_SAFE_NO_PAD.encode(bytes)
}
