use anyhow::{Context, Result};
use keyring::Entry;

const SERVICE_NAME: &str = "icloud-sync";

fn entry_for(username: &str) -> Result<Entry> {
    Entry::new(SERVICE_NAME, username).context("failed to open keyring entry")
}

pub fn store(username: &str, password: &str) -> Result<()> {
    if password.is_empty() {
        return Ok(());
    }
    let entry = entry_for(username)?;
    entry
        .set_password(password)
        .context("failed to store password in keyring")
}

pub fn load(username: &str) -> Result<Option<String>> {
    let entry = entry_for(username)?;
    match entry.get_password() {
        Ok(password) => Ok(Some(password)),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(err) => Err(err).context("failed to read password from keyring"),
    }
}

#[allow(dead_code)]
pub fn delete(username: &str) -> Result<()> {
    let entry = entry_for(username)?;
    match entry.delete_password() {
        Ok(_) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(err) => Err(err).context("failed to delete password from keyring"),
    }
}
