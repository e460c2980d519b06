//! Boot-time script run by a freshly launched instance.
//!
//! The repository URL and integration names are checked against allow-lists
//! before they are interpolated. The deploy token is single-quoted, exported
//! only for the duration of the clone and read by git through a credential
//! helper, so it never appears on a command line or in the boot log.

use vm_core::validation::{validate_integration_name, validate_repo_url};

use crate::error::Result;

/// Login user of the machine image
pub const INSTANCE_USER: &str = "ubuntu";

const WORKSPACE_DIR: &str = "/home/ubuntu/workspace";
const STATE_DIR: &str = "/home/ubuntu/.workspace";
const BOOT_LOG: &str = "/var/log/workspace-init.log";

/// Quote `value` for a POSIX shell
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Build the script passed to the provider as user data.
///
/// `bootstrap_command` is operator configuration and is appended verbatim.
pub fn build_boot_script(
    repo_url: &str,
    deploy_token: Option<&str>,
    integrations: &[String],
    bootstrap_command: Option<&str>,
) -> Result<String> {
    validate_repo_url(repo_url)?;
    for name in integrations {
        validate_integration_name(name)?;
    }

    let mut script = String::new();
    script.push_str("#!/bin/bash\n");
    script.push_str("set -euo pipefail\n");
    script.push_str(&format!("exec >>{} 2>&1\n\n", BOOT_LOG));

    script.push_str("export DEBIAN_FRONTEND=noninteractive\n");
    script.push_str("apt-get update -y\n");
    script.push_str("apt-get install -y git\n\n");

    script.push_str(&format!("mkdir -p {}\n", STATE_DIR));

    let quoted_url = shell_quote(repo_url);
    match deploy_token.filter(|t| !t.is_empty()) {
        Some(token) => {
            script.push_str(&format!(
                "export WORKSPACE_DEPLOY_TOKEN={}\n",
                shell_quote(token)
            ));
            script.push_str(&format!(
                "if git -c credential.helper='!f() {{ echo username=x-access-token; echo \"password=${{WORKSPACE_DEPLOY_TOKEN}}\"; }}; f' clone {} {}; then\n",
                quoted_url, WORKSPACE_DIR
            ));
            script.push_str("  unset WORKSPACE_DEPLOY_TOKEN\n");
            script.push_str("else\n");
            script.push_str("  unset WORKSPACE_DEPLOY_TOKEN\n");
            script.push_str("  echo 'repository clone failed' >&2\n");
            script.push_str("  exit 1\n");
            script.push_str("fi\n\n");
        }
        None => {
            script.push_str(&format!("git clone {} {}\n\n", quoted_url, WORKSPACE_DIR));
        }
    }

    script.push_str(&format!(
        "cat > {}/integrations <<'WORKSPACE_INTEGRATIONS'\n",
        STATE_DIR
    ));
    for name in integrations {
        script.push_str(name);
        script.push('\n');
    }
    script.push_str("WORKSPACE_INTEGRATIONS\n\n");

    if let Some(command) = bootstrap_command {
        script.push_str(command);
        script.push_str("\n\n");
    }

    script.push_str(&format!(
        "chown -R {user}:{user} {} {}\n",
        WORKSPACE_DIR,
        STATE_DIR,
        user = INSTANCE_USER
    ));
    script.push_str(&format!("touch {}/ready\n", STATE_DIR));

    Ok(script)
}
