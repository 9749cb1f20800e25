use crate::domain::account::UserBalance;
use crate::error::Result;
use std::io::Write;

/// Writes user balances as `user,available,withdrawn` CSV rows.
pub struct BalanceWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> BalanceWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write_balances(&mut self, balances: impl IntoIterator<Item = UserBalance>) -> Result<()> {
        self.writer.write_record(["user", "available", "withdrawn"])?;
        for balance in balances {
            self.writer.write_record([
                balance.user_id.to_string(),
                balance.available.0.normalize().to_string(),
                balance.withdrawn.0.normalize().to_string(),
            ])?;
        }
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::account::Balance;
    use rust_decimal_macros::dec;

    #[test]
    fn test_writes_header_and_normalized_amounts() {
        let mut balance = UserBalance::new(7);
        balance.available = Balance::new(dec!(50.00));

        let mut out = Vec::new();
        BalanceWriter::new(&mut out)
            .write_balances([balance, UserBalance::new(8)])
            .unwrap();

        assert_eq!(
            String::from_utf8(out).unwrap(),
            "user,available,withdrawn\n7,50,0\n8,0,0\n"
        );
    }
}
