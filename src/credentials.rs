use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::command::shell_quote;
use crate::credential::{Credential, CredentialData, PermissionLevel, SecretAttr, SecretCodec};
use crate::error::{Error, Result};
use crate::execution::ExecutionData;
use crate::job::JobData;
use crate::secrets::SecretFiles;

/// Path of the materialized secret `attr` below `dir`.
pub fn secret_file(dir: &Path, attr: SecretAttr) -> PathBuf {
    dir.join(format!(".secret_{}", attr.name()))
}

/// Picks the credential set of an execution and turns it into ansible-playbook arguments.
#[derive(Debug, Clone)]
pub struct CredentialResolver {
    store: Credential,
    codec: Arc<dyn SecretCodec>,
}

impl CredentialResolver {
    pub fn new(store: Credential, codec: Arc<dyn SecretCodec>) -> Self {
        Self { store, codec }
    }

    /// First match wins:
    /// 1. the execution's personal credential, when owned by the execution's user
    /// 2. the execution's global credential, when readable
    /// 3. the job's default global credential, when readable
    /// 4. with `credentials_needed`, the user's first personal credential
    #[instrument(skip_all, fields(job = %job.id, execution = %execution.id))]
    pub async fn resolve(&self, job: &JobData, execution: &ExecutionData) -> Result<Option<CredentialData>> {
        let user: Option<&str> = execution.user.as_deref();
        let mut resolved: Option<CredentialData> = None;

        if let (Some(user), Some(id)) = (user, execution.credential_user.as_deref()) {
            if let Some(credential) = self.store.get(id).await? {
                if credential.user.as_deref() == Some(user) {
                    resolved = Some(credential);
                }
            }
        }
        if resolved.is_none() {
            if let Some(id) = execution.credential_global.as_deref() {
                resolved = self.readable_global(id, user).await?;
            }
        }
        if resolved.is_none() {
            if let Some(id) = job.credentials_default.as_deref() {
                resolved = self.readable_global(id, user).await?;
            }
        }
        if resolved.is_none() && job.credentials_needed {
            if let Some(user) = user {
                resolved = self.store.list_personal(user).await?.into_iter().next();
            }
        }

        match &resolved {
            Some(credential) => debug!("using credentials '{}'", credential.name),
            None if job.credentials_needed => {
                return Err(Error::config(
                    "the job requires credentials but none were provided or readable",
                ))
            }
            None => {}
        }
        Ok(resolved)
    }

    async fn readable_global(&self, id: &str, user: Option<&str>) -> Result<Option<CredentialData>> {
        let Some(credential) = self.store.get(id).await? else {
            return Ok(None);
        };
        if !credential.is_global() {
            return Ok(None);
        }
        let permitted: bool = match user {
            None => true,
            Some(user) => self.store.has_permission(id, user, PermissionLevel::Read).await?,
        };
        if !permitted {
            info!("user '{}' has no permission to use credentials '{}'", user.unwrap_or_default(), credential.name);
            return Ok(None);
        }
        Ok(Some(credential))
    }

    /// Writes each secret attribute to `<dir>/.secret_<attr>` and returns the
    /// ansible-playbook arguments for the public and secret attributes.
    pub fn materialize(&self, credential: &CredentialData, dir: &Path, secrets: &mut SecretFiles) -> Result<Vec<String>> {
        let mut args: Vec<String> = credential
            .public_args()
            .into_iter()
            .map(|(flag, value)| format!("{} {}", flag, shell_quote(value)))
            .collect();
        for attr in SecretAttr::ALL {
            if let Some(plaintext) = credential.reveal(attr, self.codec.as_ref())? {
                let path: PathBuf = secret_file(dir, attr);
                secrets.write(path.clone(), &plaintext)?;
                args.push(format!("{} {}", attr.flag(), shell_quote(&path.to_string_lossy())));
            }
        }
        Ok(args)
    }

    pub async fn get(&self, id: &str) -> Result<Option<CredentialData>> {
        self.store.get(id).await
    }

    pub fn codec(&self) -> &dyn SecretCodec {
        self.codec.as_ref()
    }
}
