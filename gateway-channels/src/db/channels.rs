use crate::schema::payment_channels;
use crate::types::AllocationId;
use crate::types::ChannelId;
use crate::types::ChannelSnapshot;
use bigdecimal::BigDecimal;
use bigdecimal::ToPrimitive;
use diesel::dsl::count_star;
use diesel::dsl::sql;
use diesel::sql_types::Bool;
use diesel::sql_types::Text;
use diesel::AsChangeset;
use diesel::ExpressionMethods;
use diesel::Insertable;
use diesel::OptionalExtension;
use diesel::PgConnection;
use diesel::QueryDsl;
use diesel::QueryResult;
use diesel::Queryable;
use diesel::RunQueryDsl;
use num_bigint::BigUint;
use std::str::FromStr;
use time::OffsetDateTime;

#[derive(Insertable, Queryable, AsChangeset, Debug, Clone, PartialEq)]
#[diesel(table_name = payment_channels)]
pub(crate) struct Row {
    pub channel_id: String,
    pub context_id: String,
    pub turn_num: i64,
    pub payer_bal: BigDecimal,
    pub receiver_bal: BigDecimal,
    pub app_data: Vec<u8>,
    pub outcome: Vec<u8>,
    pub retired: bool,
    pub updated_at: OffsetDateTime,
}

impl From<&ChannelSnapshot> for Row {
    fn from(s: &ChannelSnapshot) -> Self {
        Row {
            channel_id: s.channel_id.0.clone(),
            context_id: s.context_id.0.clone(),
            turn_num: s.turn_num as i64,
            payer_bal: big_uint_to_decimal(&s.payer_bal),
            receiver_bal: big_uint_to_decimal(&s.receiver_bal),
            app_data: s.app_data.clone(),
            outcome: s.outcome.clone(),
            retired: s.retired,
            updated_at: s.updated_at,
        }
    }
}

impl From<Row> for ChannelSnapshot {
    fn from(r: Row) -> Self {
        ChannelSnapshot {
            channel_id: ChannelId(r.channel_id),
            context_id: AllocationId(r.context_id),
            turn_num: r.turn_num as u64,
            payer_bal: decimal_to_big_uint(&r.payer_bal),
            receiver_bal: decimal_to_big_uint(&r.receiver_bal),
            app_data: r.app_data,
            outcome: r.outcome,
            retired: r.retired,
            updated_at: r.updated_at,
        }
    }
}

pub(crate) fn big_uint_to_decimal(value: &BigUint) -> BigDecimal {
    BigDecimal::from_str(&value.to_str_radix(10)).expect("big uint is valid decimal")
}

pub(crate) fn decimal_to_big_uint(value: &BigDecimal) -> BigUint {
    value
        .to_u128()
        .map(BigUint::from)
        .unwrap_or_else(|| BigUint::from_str(&value.to_string()).expect("valid decimal"))
}

/// Inserts a batch of freshly created channels, upserting on primary-key conflict. A
/// conflicting row only has its `turn_num` (and accompanying columns) promoted when the
/// existing row is at `turn_num = 0` and the incoming row is at `turn_num = 3` -- the
/// "proposed -> ready" handoff. Every other conflict is a no-op, preserving whichever side
/// observed the channel first.
pub(crate) fn insert_channels(conn: &mut PgConnection, rows: &[Row]) -> QueryResult<Vec<String>> {
    let mut inserted = Vec::with_capacity(rows.len());
    for row in rows {
        let affected = diesel::sql_query(
            r#"
            INSERT INTO payment_channels
                (channel_id, context_id, turn_num, payer_bal, receiver_bal, app_data, outcome, retired, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (channel_id) DO UPDATE SET
                turn_num = CASE
                    WHEN payment_channels.turn_num = 0 AND EXCLUDED.turn_num = 3
                    THEN EXCLUDED.turn_num ELSE payment_channels.turn_num END,
                app_data = CASE
                    WHEN payment_channels.turn_num = 0 AND EXCLUDED.turn_num = 3
                    THEN EXCLUDED.app_data ELSE payment_channels.app_data END,
                outcome = CASE
                    WHEN payment_channels.turn_num = 0 AND EXCLUDED.turn_num = 3
                    THEN EXCLUDED.outcome ELSE payment_channels.outcome END,
                payer_bal = CASE
                    WHEN payment_channels.turn_num = 0 AND EXCLUDED.turn_num = 3
                    THEN EXCLUDED.payer_bal ELSE payment_channels.payer_bal END,
                receiver_bal = CASE
                    WHEN payment_channels.turn_num = 0 AND EXCLUDED.turn_num = 3
                    THEN EXCLUDED.receiver_bal ELSE payment_channels.receiver_bal END,
                updated_at = CASE
                    WHEN payment_channels.turn_num = 0 AND EXCLUDED.turn_num = 3
                    THEN EXCLUDED.updated_at ELSE payment_channels.updated_at END
            "#,
        )
        .bind::<Text, _>(&row.channel_id)
        .bind::<Text, _>(&row.context_id)
        .bind::<diesel::sql_types::BigInt, _>(row.turn_num)
        .bind::<diesel::sql_types::Numeric, _>(&row.payer_bal)
        .bind::<diesel::sql_types::Numeric, _>(&row.receiver_bal)
        .bind::<diesel::sql_types::Bytea, _>(&row.app_data)
        .bind::<diesel::sql_types::Bytea, _>(&row.outcome)
        .bind::<Bool, _>(row.retired)
        .bind::<diesel::sql_types::Timestamptz, _>(row.updated_at)
        .execute(conn)?;

        if affected > 0 {
            inserted.push(row.channel_id.clone());
        }
    }
    Ok(inserted)
}

pub(crate) fn remove_channels(conn: &mut PgConnection, ids: &[String]) -> QueryResult<usize> {
    diesel::delete(payment_channels::table.filter(payment_channels::channel_id.eq_any(ids)))
        .execute(conn)
}

/// Flips `retired = true` on every non-retired row for `ctx`, returning the rows just
/// retired so the caller can compute the amount conserved.
pub(crate) fn retire_channels(conn: &mut PgConnection, ctx: &str) -> QueryResult<Vec<Row>> {
    diesel::update(
        payment_channels::table
            .filter(payment_channels::context_id.eq(ctx))
            .filter(payment_channels::retired.eq(false)),
    )
    .set(payment_channels::retired.eq(true))
    .get_results(conn)
}

pub(crate) fn active_channels(conn: &mut PgConnection, ctx: &str) -> QueryResult<Vec<String>> {
    payment_channels::table
        .filter(payment_channels::context_id.eq(ctx))
        .filter(payment_channels::retired.eq(false))
        .select(payment_channels::channel_id)
        .load(conn)
}

pub(crate) fn active_allocation_counts(
    conn: &mut PgConnection,
    ctx_filter: Option<&[String]>,
) -> QueryResult<Vec<(String, i64)>> {
    let mut query = payment_channels::table
        .filter(payment_channels::retired.eq(false))
        .into_boxed();

    if let Some(ids) = ctx_filter {
        query = query.filter(payment_channels::context_id.eq_any(ids.to_vec()));
    }

    query
        .group_by(payment_channels::context_id)
        .select((payment_channels::context_id, count_star()))
        .load(conn)
}

pub(crate) fn closable_channels(conn: &mut PgConnection) -> QueryResult<Vec<(String, String)>> {
    payment_channels::table
        .filter(payment_channels::retired.eq(true))
        .select((payment_channels::context_id, payment_channels::channel_id))
        .load(conn)
}

pub(crate) fn readying_channels(conn: &mut PgConnection, ctx: &str) -> QueryResult<Vec<String>> {
    payment_channels::table
        .filter(payment_channels::context_id.eq(ctx))
        .filter(payment_channels::turn_num.eq(0))
        .filter(payment_channels::retired.eq(false))
        .select(payment_channels::channel_id)
        .load(conn)
}

pub(crate) fn stalled_channels(
    conn: &mut PgConnection,
    cutoff: OffsetDateTime,
    ctx: Option<&str>,
    limit: Option<i64>,
) -> QueryResult<Vec<String>> {
    let mut query = payment_channels::table
        .filter(sql::<Bool>("turn_num % 2 = 0"))
        .filter(payment_channels::retired.eq(false))
        .filter(payment_channels::updated_at.le(cutoff))
        .into_boxed();

    if let Some(ctx) = ctx {
        query = query.filter(payment_channels::context_id.eq(ctx.to_string()));
    }

    if let Some(limit) = limit {
        // Randomised ordering prevents the same stalled channels from permanently starving
        // out channels further down a deterministic ordering.
        query = query.order(sql::<Text>("random()")).limit(limit);
    }

    query.select(payment_channels::channel_id).load(conn)
}

/// Picks one free row for `ctx` and locks it for the duration of the caller's transaction,
/// skipping rows already locked by a concurrent acquirer. Returns `None` when no row is
/// currently eligible -- the caller maps that into `GatewayError::NoFreeChannels`.
pub(crate) fn acquire_free_row(conn: &mut PgConnection, ctx: &str) -> QueryResult<Option<Row>> {
    payment_channels::table
        .filter(payment_channels::context_id.eq(ctx))
        .filter(sql::<Bool>("turn_num % 2 = 1"))
        .filter(payment_channels::retired.eq(false))
        .order(sql::<Text>("random()"))
        .limit(1)
        .for_update()
        .skip_locked()
        .first(conn)
        .optional()
}

/// Writes an updated snapshot back into its row. A no-op if the row has since been retired
/// by a concurrent `retire_channels` -- the lease is still released, just without effect.
pub(crate) fn write_back(conn: &mut PgConnection, row: &Row) -> QueryResult<usize> {
    diesel::update(
        payment_channels::table
            .filter(payment_channels::channel_id.eq(&row.channel_id))
            .filter(payment_channels::retired.eq(false)),
    )
    .set((
        payment_channels::turn_num.eq(row.turn_num),
        payment_channels::payer_bal.eq(&row.payer_bal),
        payment_channels::receiver_bal.eq(&row.receiver_bal),
        payment_channels::app_data.eq(&row.app_data),
        payment_channels::outcome.eq(&row.outcome),
        payment_channels::updated_at.eq(row.updated_at),
    ))
    .execute(conn)
}

pub(crate) fn get_by_channel_id(
    conn: &mut PgConnection,
    channel_id: &str,
) -> QueryResult<Option<Row>> {
    payment_channels::table
        .filter(payment_channels::channel_id.eq(channel_id))
        .first(conn)
        .optional()
}

pub(crate) fn clear_cache(conn: &mut PgConnection) -> QueryResult<usize> {
    diesel::delete(payment_channels::table).execute(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn big_uint_round_trips_through_decimal() {
        let amount = BigUint::from(123_456_789_u64);
        let decimal = big_uint_to_decimal(&amount);
        assert_eq!(decimal_to_big_uint(&decimal), amount);
    }
}
