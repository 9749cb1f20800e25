use crate::domain::order::OrderNumber;
use crate::error::{AccrualError, Result};
use serde::Deserialize;
use std::io::Read;

#[derive(Debug, Deserialize)]
struct OrderRow {
    user: i64,
    order: String,
}

/// An order to submit on behalf of a user.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderSubmission {
    pub user_id: i64,
    pub order: OrderNumber,
}

/// Reads `user,order` rows from a CSV source.
///
/// Wraps `csv::Reader` and yields one `Result<OrderSubmission>` per row, so a
/// bad row (unparsable user, Luhn failure) does not stop the rest.
pub struct OrderReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> OrderReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Lazily reads and validates submissions.
    pub fn submissions(self) -> impl Iterator<Item = Result<OrderSubmission>> {
        self.reader.into_deserialize().map(|row| {
            let row: OrderRow = row.map_err(AccrualError::from)?;
            Ok(OrderSubmission {
                user_id: row.user,
                order: OrderNumber::parse(&row.order)?,
            })
        })
    }
}
