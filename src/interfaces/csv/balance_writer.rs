use crate::domain::account::Account;
use crate::error::Result;
use std::io::Write;

/// Writes final account balances as CSV.
pub struct BalanceWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> BalanceWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write_accounts(&mut self, accounts: Vec<Account>) -> Result<()> {
        self.writer
            .write_record(["account", "mcredits", "msats", "available"])?;
        for account in accounts {
            self.writer.write_record([
                account.id.0.to_string(),
                account.mcredits.0.to_string(),
                account.msats.0.to_string(),
                account.available().0.to_string(),
            ])?;
        }
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::account::AccountId;
    use crate::domain::msats::Msats;

    #[test]
    fn test_writes_header_and_rows() {
        let mut out = Vec::new();
        {
            let mut writer = BalanceWriter::new(&mut out);
            writer
                .write_accounts(vec![Account {
                    id: AccountId(1),
                    mcredits: Msats(500),
                    msats: Msats(1500),
                }])
                .unwrap();
        }
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("account,mcredits,msats,available"));
        assert!(text.contains("1,500,1500,2000"));
    }
}
