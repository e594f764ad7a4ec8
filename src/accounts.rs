use crate::protocol::Account;

#[derive(Debug, Clone, PartialEq)]
pub enum ReloadOutcome {
    Selected(Account),
    Empty,
    Failed(String),
    /// The registry was cleared while the reload was in flight.
    Superseded,
}

/// Registered broker accounts and the one used for SSO.
#[derive(Debug, Default, Clone)]
pub struct AccountRegistry {
    registered: Vec<Account>,
    active: Option<Account>,
    queried: bool,
    epoch: u64,
}

impl AccountRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ticket for a reload about to be issued. A `clear` in between
    /// invalidates it.
    pub fn begin_reload(&self) -> u64 {
        self.epoch
    }

    /// Applies a `getAccounts` result. The first listed account becomes
    /// active; errors leave the previous selection alone.
    pub fn apply_reload(
        &mut self,
        ticket: u64,
        result: Result<Vec<Account>, String>,
    ) -> ReloadOutcome {
        if !self.is_current(ticket) {
            return ReloadOutcome::Superseded;
        }
        self.queried = true;

        let accounts = match result {
            Ok(accounts) => accounts,
            Err(reason) => return ReloadOutcome::Failed(reason),
        };

        self.registered = accounts;
        self.active = self.registered.first().cloned();
        match &self.active {
            Some(account) => ReloadOutcome::Selected(account.clone()),
            None => ReloadOutcome::Empty,
        }
    }

    /// Whether nothing cleared the registry since `ticket` was taken.
    pub fn is_current(&self, ticket: u64) -> bool {
        ticket == self.epoch
    }

    pub fn clear(&mut self) {
        self.active = None;
        self.queried = false;
        self.epoch = self.epoch.wrapping_add(1);
    }

    pub fn active(&self) -> Option<&Account> {
        self.active.as_ref()
    }

    pub fn registered(&self) -> &[Account] {
        &self.registered
    }

    pub fn is_queried(&self) -> bool {
        self.queried
    }
}
