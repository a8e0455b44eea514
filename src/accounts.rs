//! # Account Capabilities
//!
//! Resolves an account type (plus data set) to what the contact sources behind
//! it support: writability, invitations, view notifications and label lookup.

use crate::model::AccountTypeKey;
use anyhow::{anyhow, Result};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

/// Service that wants to hear when one of its raw contacts is viewed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NotifyEndpoint {
    pub package: String,
    pub service: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountTypeInfo {
    pub key: AccountTypeKey,
    pub writable: bool,
    /// Offers an "invite" action for contacts it does not hold.
    pub invitable: bool,
    pub invite_label: Option<String>,
    pub view_notify: Option<NotifyEndpoint>,
}

impl AccountTypeInfo {
    pub fn writable(key: AccountTypeKey) -> Self {
        Self {
            key,
            writable: true,
            invitable: false,
            invite_label: None,
            view_notify: None,
        }
    }

    pub fn read_only(key: AccountTypeKey) -> Self {
        Self {
            writable: false,
            ..Self::writable(key)
        }
    }

    pub fn with_invite(mut self, label: &str) -> Self {
        self.invitable = true;
        self.invite_label = Some(label.to_string());
        self
    }

    pub fn with_view_notify(mut self, package: &str, service: &str) -> Self {
        self.view_notify = Some(NotifyEndpoint {
            package: package.to_string(),
            service: service.to_string(),
        });
        self
    }
}

/// Capability lookup consumed by the assembler and save paths.
pub trait AccountTypes: Send + Sync {
    fn account_type(&self, key: &AccountTypeKey) -> Option<AccountTypeInfo>;

    /// Every account type that can invite, across all configured accounts.
    fn invitable_account_types(&self) -> Vec<AccountTypeInfo>;

    /// Looks up a string resource published by `package`.
    fn resolve_label(&self, package: &str, res_id: i64) -> Result<String>;

    /// Local accounts and unknown types are writable.
    fn is_writable(&self, key: &AccountTypeKey) -> bool {
        self.account_type(key).map_or(true, |info| info.writable)
    }
}

/// Fixed registry, populated up front.
#[derive(Debug, Clone, Default)]
pub struct StaticAccountTypes {
    types: HashMap<AccountTypeKey, AccountTypeInfo>,
    labels: HashMap<(String, i64), String>,
}

impl StaticAccountTypes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_type(mut self, info: AccountTypeInfo) -> Self {
        self.types.insert(info.key.clone(), info);
        self
    }

    pub fn with_label(mut self, package: &str, res_id: i64, label: &str) -> Self {
        self.labels
            .insert((package.to_string(), res_id), label.to_string());
        self
    }
}

impl AccountTypes for StaticAccountTypes {
    fn account_type(&self, key: &AccountTypeKey) -> Option<AccountTypeInfo> {
        self.types.get(key).cloned()
    }

    fn invitable_account_types(&self) -> Vec<AccountTypeInfo> {
        let mut invitable: Vec<AccountTypeInfo> =
            self.types.values().filter(|t| t.invitable).cloned().collect();
        invitable.sort_by(|a, b| a.key.cmp(&b.key));
        invitable
    }

    fn resolve_label(&self, package: &str, res_id: i64) -> Result<String> {
        self.labels
            .get(&(package.to_string(), res_id))
            .cloned()
            .ok_or_else(|| anyhow!("no label {res_id} in package {package}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_registry() {
        let registry = StaticAccountTypes::new()
            .with_type(AccountTypeInfo::read_only(AccountTypeKey::new("com.social", None)))
            .with_type(
                AccountTypeInfo::writable(AccountTypeKey::new("com.mail", None))
                    .with_invite("Invite to Mail"),
            )
            .with_label("com.dir", 3, "Corporate");

        assert!(!registry.is_writable(&AccountTypeKey::new("com.social", None)));
        assert!(registry.is_writable(&AccountTypeKey::default()));
        assert_eq!(registry.invitable_account_types().len(), 1);
        assert_eq!(registry.resolve_label("com.dir", 3).unwrap(), "Corporate");
        assert!(registry.resolve_label("com.dir", 4).is_err());
    }
}
