use crate::config::{MAX_ACCOUNTS, RuntimeConfig};

/// One upstream credential pair. `index` is the 1-based slot number and fixes
/// the position of the account in failover order.
#[derive(Clone, PartialEq, Eq)]
pub struct Account {
    pub index: u32,
    pub token: String,
    pub account_id: String,
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("index", &self.index)
            .field("token", &"<redacted>")
            .field("account_id", &self.account_id)
            .finish()
    }
}

/// Accounts in ascending slot order. May be empty.
#[derive(Debug, Clone, Default)]
pub struct AccountPool {
    accounts: Vec<Account>,
}

impl AccountPool {
    /// Scans slots `1..=MAX_ACCOUNTS` and keeps every slot whose token and
    /// account id are both present and non-blank.
    pub fn from_config(config: &RuntimeConfig) -> Self {
        let accounts = (1..=MAX_ACCOUNTS)
            .filter_map(|index| {
                let slot = config.credential_slots.get(&index)?;
                let token = non_blank(slot.token.as_deref())?;
                let account_id = non_blank(slot.account_id.as_deref())?;
                Some(Account {
                    index,
                    token: token.to_string(),
                    account_id: account_id.to_string(),
                })
            })
            .collect();
        Self { accounts }
    }

    pub fn from_accounts(mut accounts: Vec<Account>) -> Self {
        accounts.sort_by_key(|account| account.index);
        Self { accounts }
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Account> {
        self.accounts.iter()
    }

    pub fn indices(&self) -> Vec<u32> {
        self.accounts.iter().map(|account| account.index).collect()
    }
}

impl<'a> IntoIterator for &'a AccountPool {
    type Item = &'a Account;
    type IntoIter = std::slice::Iter<'a, Account>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CredentialSlot;

    #[test]
    fn empty_config_yields_empty_pool() {
        let pool = AccountPool::from_config(&RuntimeConfig::default());
        assert!(pool.is_empty());
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn pool_keeps_complete_slots_in_ascending_order() {
        let mut cfg = RuntimeConfig::default()
            .with_account(7, "tok-7", "acc-7")
            .with_account(2, "tok-2", "acc-2")
            .with_account(4, "tok-4", "acc-4");
        cfg.credential_slots.insert(
            3,
            CredentialSlot {
                token: Some("tok-3".into()),
                account_id: None,
            },
        );
        cfg.credential_slots.insert(
            5,
            CredentialSlot {
                token: Some(" ".into()),
                account_id: Some("acc-5".into()),
            },
        );

        let pool = AccountPool::from_config(&cfg);
        assert_eq!(pool.indices(), vec![2, 4, 7]);
        let first = pool.iter().next().unwrap();
        assert_eq!(first.token, "tok-2");
        assert_eq!(first.account_id, "acc-2");
    }

    #[test]
    fn slots_beyond_maximum_are_ignored() {
        let cfg = RuntimeConfig::default()
            .with_account(MAX_ACCOUNTS, "tok", "acc")
            .with_account(MAX_ACCOUNTS + 1, "tok", "acc");
        let pool = AccountPool::from_config(&cfg);
        assert_eq!(pool.indices(), vec![MAX_ACCOUNTS]);
    }

    #[test]
    fn same_config_builds_same_pool() {
        let cfg = RuntimeConfig::default()
            .with_account(1, "a", "b")
            .with_account(2, "c", "d");
        assert_eq!(
            AccountPool::from_config(&cfg).indices(),
            AccountPool::from_config(&cfg).indices()
        );
    }

    #[test]
    fn debug_output_hides_token() {
        let account = Account {
            index: 1,
            token: "secret-token".into(),
            account_id: "acc".into(),
        };
        assert!(!format!("{account:?}").contains("secret-token"));
    }
}
