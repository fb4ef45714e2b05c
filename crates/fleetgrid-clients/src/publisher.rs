//! File-backed script publisher.
//!
//! Renders the device upgrade playbook for a rollout into
//! `{dir}/{account}/playbooks/` and hands out the API URL devices fetch it
//! from. The API serves the file back through [`ScriptPublisher::fetch`].

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::info;

use fleetgrid_rollout::{RemoteInfo, ScriptPublisher};
use fleetgrid_state::RolloutId;

use crate::error::ClientError;

const PLAYBOOK_TEMPLATE: &str = r#"- name: Run the ostree upgrade in a loop
  hosts: localhost
  become: yes
  vars:
    fleet_infra_env: "@@FLEET_ENV@@"
    update_number: "@@UPDATE_NUMBER@@"
    ostree_remote_name: "@@REMOTE_NAME@@"
    ostree_remote_url: "@@REMOTE_URL@@"
    ostree_content_url: "@@CONTENT_URL@@"
    ostree_gpg_verify: "@@GPG_VERIFY@@"
  tasks:
    - name: apply templated ostree remote config
      ansible.builtin.copy:
        content: |
          [remote "{{ ostree_remote_name }}"]
          url={{ ostree_remote_url }}
          gpg-verify={{ ostree_gpg_verify }}
          contenturl={{ ostree_content_url }}
        dest: /etc/ostree/remotes.d/rhel-edge.conf
    - name: run rpmostree update
      ansible.builtin.shell: rpm-ostree upgrade --allow-downgrade
      register: rpmostree_upgrade_out
      changed_when: '"No upgrade available" not in rpmostree_upgrade_out.stdout'
      failed_when: 'rpmostree_upgrade_out.rc != 0'
    - name: schedule reboot when rpmostree upgraded
      ansible.builtin.shell: systemd-run --on-active=5 /usr/bin/systemctl reboot
      when: rpmostree_upgrade_out.changed
"#;

/// Writes rendered playbooks to disk and serves them back.
#[derive(Debug, Clone)]
pub struct FilePublisher {
    dir: PathBuf,
    public_url: String,
    fleet_env: String,
}

impl FilePublisher {
    pub fn new(dir: impl Into<PathBuf>, public_url: &str, fleet_env: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            public_url: public_url.trim_end_matches('/').to_string(),
            fleet_env: fleet_env.into(),
        }
    }

    /// Where the playbook of a rollout lives on disk.
    pub fn playbook_path(&self, account: &str, rollout_id: RolloutId) -> Result<PathBuf, ClientError> {
        validate_account(account)?;
        Ok(self
            .dir
            .join(account)
            .join("playbooks")
            .join(format!("playbook_dispatcher_update_{account}_{rollout_id}.yml")))
    }

    /// URL devices are given to download a rollout's playbook.
    pub fn playbook_url(&self, rollout_id: RolloutId) -> String {
        format!("{}/api/v1/updates/{rollout_id}/update-playbook.yml", self.public_url)
    }

    fn render(&self, remote: &RemoteInfo) -> String {
        PLAYBOOK_TEMPLATE
            .replace("@@FLEET_ENV@@", &yaml_escape(&self.fleet_env))
            .replace("@@UPDATE_NUMBER@@", &remote.rollout_id.to_string())
            .replace("@@REMOTE_NAME@@", &yaml_escape(&remote.remote_name))
            .replace("@@REMOTE_URL@@", &yaml_escape(&remote.remote_url))
            .replace("@@CONTENT_URL@@", &yaml_escape(&remote.content_url))
            .replace("@@GPG_VERIFY@@", if remote.gpg_verify { "true" } else { "false" })
    }
}

/// Escape a value for a double-quoted YAML scalar.
fn yaml_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

/// Account names become path segments; keep them to one plain segment.
fn validate_account(account: &str) -> Result<(), ClientError> {
    let plain = !account.is_empty()
        && account
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        && Path::new(account).components().count() == 1;
    if plain {
        Ok(())
    } else {
        Err(ClientError::InvalidUrl(format!("account {account:?} is not a valid path segment")))
    }
}

#[async_trait]
impl ScriptPublisher for FilePublisher {
    async fn publish(&self, remote: &RemoteInfo, account: &str) -> anyhow::Result<String> {
        let path = self.playbook_path(account, remote.rollout_id)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(ClientError::from)?;
        }
        tokio::fs::write(&path, self.render(remote))
            .await
            .map_err(ClientError::from)?;

        let url = self.playbook_url(remote.rollout_id);
        info!(rollout_id = remote.rollout_id, path = %path.display(), %url, "playbook published");
        Ok(url)
    }

    async fn fetch(&self, account: &str, rollout_id: RolloutId) -> anyhow::Result<Vec<u8>> {
        let path = self.playbook_path(account, rollout_id)?;
        Ok(tokio::fs::read(&path).await.map_err(ClientError::from)?)
    }
}
