// @generated manually to match migrations/ -- see db/channels.rs and db/ledger_channels.rs.

diesel::table! {
    payment_channels (channel_id) {
        channel_id -> Text,
        context_id -> Text,
        turn_num -> Int8,
        payer_bal -> Numeric,
        receiver_bal -> Numeric,
        app_data -> Bytea,
        outcome -> Bytea,
        retired -> Bool,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    ledger_channels (channel_id) {
        channel_id -> Text,
        context_id -> Text,
        initial_outcome -> Bytea,
    }
}

diesel::allow_tables_to_appear_in_same_query!(payment_channels, ledger_channels);
