use std::fmt::Debug;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::database::{bindings, new_id, Db};
use crate::error::Result;

/// Encryption-at-rest of secret credential attributes.
pub trait SecretCodec: Send + Sync + Debug {
    fn encrypt(&self, plaintext: &str) -> Result<String>;
    fn decrypt(&self, ciphertext: &str) -> Result<String>;
}

/// Passthrough codec for stores that encrypt at rest on their own.
#[derive(Debug, Clone, Default)]
pub struct PlainCodec;

impl SecretCodec for PlainCodec {
    fn encrypt(&self, plaintext: &str) -> Result<String> {
        Ok(plaintext.to_string())
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String> {
        Ok(ciphertext.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecretAttr {
    BecomePass,
    VaultPass,
    ConnectPass,
    SshKey,
}

impl SecretAttr {
    pub const ALL: [SecretAttr; 4] = [Self::BecomePass, Self::VaultPass, Self::ConnectPass, Self::SshKey];

    pub fn name(&self) -> &'static str {
        match self {
            Self::BecomePass => "become_pass",
            Self::VaultPass => "vault_pass",
            Self::ConnectPass => "connect_pass",
            Self::SshKey => "ssh_key",
        }
    }

    /// ansible-playbook flag taking the path of the materialized secret.
    pub fn flag(&self) -> &'static str {
        match self {
            Self::BecomePass => "--become-password-file",
            Self::VaultPass => "--vault-password-file",
            Self::ConnectPass => "--connection-password-file",
            Self::SshKey => "--key-file",
        }
    }
}

/// A credential set. `user` is `None` for global credentials and holds the
/// owner for personal ones. Secret attributes hold ciphertext.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialData {
    #[serde(rename = "uid")]
    pub id: String,
    pub name: String,
    pub user: Option<String>,
    pub connect_user: Option<String>,
    pub become_user: Option<String>,
    pub vault_file: Option<String>,
    pub vault_id: Option<String>,
    pub become_pass: Option<String>,
    pub vault_pass: Option<String>,
    pub connect_pass: Option<String>,
    pub ssh_key: Option<String>,
}

impl CredentialData {
    pub fn is_global(&self) -> bool {
        self.user.is_none()
    }

    /// Public attributes rendered as `(flag, value)`.
    pub fn public_args(&self) -> Vec<(&'static str, &str)> {
        [
            ("--user", &self.connect_user),
            ("--become-user", &self.become_user),
            ("--vault-password-file", &self.vault_file),
            ("--vault-id", &self.vault_id),
        ]
        .into_iter()
        .filter_map(|(flag, value)| match value.as_deref() {
            Some(value) if !value.is_empty() => Some((flag, value)),
            _ => None,
        })
        .collect()
    }

    pub fn secret(&self, attr: SecretAttr) -> Option<&str> {
        let value: &Option<String> = match attr {
            SecretAttr::BecomePass => &self.become_pass,
            SecretAttr::VaultPass => &self.vault_pass,
            SecretAttr::ConnectPass => &self.connect_pass,
            SecretAttr::SshKey => &self.ssh_key,
        };
        value.as_deref().filter(|value| !value.is_empty())
    }

    /// Decrypted secret attribute.
    pub fn reveal(&self, attr: SecretAttr, codec: &dyn SecretCodec) -> Result<Option<String>> {
        match self.secret(attr) {
            Some(ciphertext) => Ok(Some(codec.decrypt(ciphertext)?)),
            None => Ok(None),
        }
    }

    /// Encrypts `plaintext` into the secret attribute.
    pub fn conceal(&mut self, attr: SecretAttr, plaintext: &str, codec: &dyn SecretCodec) -> Result<()> {
        let ciphertext: Option<String> = Some(codec.encrypt(plaintext)?);
        match attr {
            SecretAttr::BecomePass => self.become_pass = ciphertext,
            SecretAttr::VaultPass => self.vault_pass = ciphertext,
            SecretAttr::ConnectPass => self.connect_pass = ciphertext,
            SecretAttr::SshKey => self.ssh_key = ciphertext,
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PermissionLevel {
    Read,
    Execute,
    Write,
    Full,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionData {
    #[serde(rename = "uid")]
    pub id: String,
    pub credential: String,
    pub user: String,
    pub level: PermissionLevel,
}

#[derive(Debug, Clone)]
pub struct Credential {
    db: Arc<Db>,
    pub table: String,
    pub table_permission: String,
}

impl Credential {
    pub fn new(db: Arc<Db>) -> Self {
        Self {
            db,
            table: "job_credential".to_string(),
            table_permission: "job_credential_permission".to_string(),
        }
    }

    pub async fn create(&self, mut data: CredentialData) -> Result<CredentialData> {
        if data.id.is_empty() {
            data.id = new_id();
        }
        self.db.create(&self.table, &data.id, &data).await?;
        Ok(data)
    }

    pub async fn get(&self, id: &str) -> Result<Option<CredentialData>> {
        self.db.get(&self.table, id).await
    }

    /// Personal credentials of `user`, in name order.
    pub async fn list_personal(&self, user: &str) -> Result<Vec<CredentialData>> {
        self.db
            .select(
                &self.table,
                vec!["`user` = $user".to_string()],
                bindings([("user", Value::String(user.to_string()))]),
                Some("name ASC"),
                None,
            )
            .await
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        self.db.remove(&self.table, id).await
    }

    pub async fn grant(&self, credential: &str, user: &str, level: PermissionLevel) -> Result<()> {
        let data = PermissionData {
            id: new_id(),
            credential: credential.to_string(),
            user: user.to_string(),
            level,
        };
        self.db.create(&self.table_permission, &data.id, &data).await
    }

    pub async fn has_permission(&self, credential: &str, user: &str, needed: PermissionLevel) -> Result<bool> {
        let rows: Vec<PermissionData> = self
            .db
            .select(
                &self.table_permission,
                vec!["credential = $credential".to_string(), "`user` = $user".to_string()],
                bindings([
                    ("credential", Value::String(credential.to_string())),
                    ("user", Value::String(user.to_string())),
                ]),
                None,
                None,
            )
            .await?;
        Ok(rows.iter().any(|row| row.level >= needed))
    }
}
