use crate::schema::ledger_channels;
use crate::types::AllocationId;
use crate::types::ChannelId;
use crate::types::LedgerSnapshot;
use diesel::ExpressionMethods;
use diesel::Insertable;
use diesel::PgConnection;
use diesel::QueryDsl;
use diesel::QueryResult;
use diesel::Queryable;
use diesel::RunQueryDsl;

#[derive(Insertable, Queryable, Debug, Clone, PartialEq)]
#[diesel(table_name = ledger_channels)]
pub(crate) struct Row {
    pub channel_id: String,
    pub context_id: String,
    pub initial_outcome: Vec<u8>,
}

impl From<Row> for LedgerSnapshot {
    fn from(r: Row) -> Self {
        LedgerSnapshot {
            channel_id: ChannelId(r.channel_id),
            context_id: AllocationId(r.context_id),
            initial_outcome: r.initial_outcome,
        }
    }
}

pub(crate) fn insert(
    conn: &mut PgConnection,
    ctx: &str,
    channel_id: &str,
    initial_outcome: &[u8],
) -> QueryResult<()> {
    diesel::insert_into(ledger_channels::table)
        .values(Row {
            channel_id: channel_id.to_string(),
            context_id: ctx.to_string(),
            initial_outcome: initial_outcome.to_vec(),
        })
        .on_conflict(ledger_channels::channel_id)
        .do_nothing()
        .execute(conn)?;
    Ok(())
}

pub(crate) fn get_for_context(conn: &mut PgConnection, ctx: &str) -> QueryResult<Vec<Row>> {
    ledger_channels::table
        .filter(ledger_channels::context_id.eq(ctx))
        .load(conn)
}

pub(crate) fn remove(conn: &mut PgConnection, ids: &[String]) -> QueryResult<usize> {
    diesel::delete(ledger_channels::table.filter(ledger_channels::channel_id.eq_any(ids)))
        .execute(conn)
}
