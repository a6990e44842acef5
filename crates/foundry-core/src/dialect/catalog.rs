//! Built-in dialect definitions.

use super::ColumnType::{Blob, Integer, Text};
use super::{
    ColumnSpec, ColumnType, DialectDefinition, DialectOverride, ForeignKey, IndexSpec, RequiredJoin,
    TableConstraint, TableSpec, CLIENT_VERSION_KEY, PROPERTIES_TABLE,
};

type ColumnDef = (&'static str, ColumnType, Option<&'static str>);

const ZERO: Option<&str> = Some("0");
const ONE: Option<&str> = Some("1");
const NULL: Option<&str> = Some("NULL");

fn columns(defs: &[ColumnDef]) -> Vec<ColumnSpec> {
    defs.iter()
        .map(|(name, column_type, default)| {
            let column = ColumnSpec::new(name, *column_type);
            match default {
                Some(value) => column.default_value(value),
                None => column,
            }
        })
        .collect()
}

fn add_table(table: TableSpec) -> DialectOverride {
    DialectOverride::AddTable { table }
}

fn add_index(name: &str, table: &str, columns: &[&str]) -> DialectOverride {
    DialectOverride::AddIndex { index: IndexSpec::new(name, table, columns) }
}

fn add_column(table: &str, (name, column_type, default): ColumnDef) -> DialectOverride {
    let column = ColumnSpec::new(name, column_type);
    DialectOverride::AddColumn {
        table: table.to_string(),
        column: match default {
            Some(value) => column.default_value(value),
            None => column,
        },
        after: None,
    }
}

fn set_client_version(value: &str) -> DialectOverride {
    DialectOverride::SetMetadata { key: CLIENT_VERSION_KEY.to_string(), value: value.to_string() }
}

pub(super) fn definitions() -> Vec<DialectDefinition> {
    vec![sonoma(), sequoia(), tahoe()]
}

fn sonoma() -> DialectDefinition {
    let overrides = vec![
        add_table(properties_table()),
        add_table(handle_table()),
        add_table(chat_table()),
        add_table(message_table()),
        add_table(attachment_table()),
        add_table(join_table("chat_handle_join", ("chat_id", "chat"), ("handle_id", "handle"))),
        add_table(
            join_table("chat_message_join", ("chat_id", "chat"), ("message_id", "message"))
                .with_column(ColumnSpec::new("message_date", Integer).default_value("0")),
        ),
        add_table(join_table(
            "message_attachment_join",
            ("message_id", "message"),
            ("attachment_id", "attachment"),
        )),
        add_table(TableSpec::new(
            "deleted_messages",
            vec![ColumnSpec::rowid().unique(), ColumnSpec::new("guid", Text).not_null()],
        )),
        add_table(sync_deleted_table("sync_deleted_messages")),
        add_table(
            sync_deleted_table("sync_deleted_chats")
                .with_column(ColumnSpec::new("timestamp", Integer)),
        ),
        add_table(sync_deleted_table("sync_deleted_attachments")),
        add_table(recoverable_join_table()),
        add_table(chat_recoverable_message_join_table()),
        add_table(
            TableSpec::new(
                "kvtable",
                vec![
                    ColumnSpec::rowid(),
                    ColumnSpec::new("key", Text).unique().not_null(),
                    ColumnSpec::new("value", Blob).not_null(),
                ],
            ),
        ),
        add_table(TableSpec::new(
            "message_processing_task",
            vec![
                ColumnSpec::rowid(),
                ColumnSpec::new("guid", Text).not_null(),
                ColumnSpec::new("task_flags", Integer).not_null(),
            ],
        )
        .with_constraint(TableConstraint::Unique(vec![
            "guid".to_string(),
            "task_flags".to_string(),
        ]))),
        add_table(TableSpec::new(
            "scheduled_messages_pending_cloudkit_delete",
            vec![
                ColumnSpec::rowid(),
                ColumnSpec::new("guid", Text).not_null(),
                ColumnSpec::new("recordID", Text),
            ],
        )),
        add_index("message_idx_handle", "message", &["handle_id", "date"]),
        add_index("message_idx_date", "message", &["date"]),
        add_index("message_idx_is_read", "message", &["is_read", "is_from_me", "is_finished"]),
        add_index("message_idx_thread_originator_guid", "message", &["thread_originator_guid"]),
        add_index("chat_message_join_idx_message_date_id_chat_id", "chat_message_join", &[
            "chat_id",
            "message_date",
            "message_id",
        ]),
        add_index(
            "chat_idx_chat_identifier_service_name",
            "chat",
            &["chat_identifier", "service_name"],
        ),
        add_index(
            "message_attachment_join_idx_message_id",
            "message_attachment_join",
            &["message_id"],
        ),
        add_index("chat_handle_join_idx_handle_id", "chat_handle_join", &["handle_id"]),
        DialectOverride::AddForeignKey {
            foreign_key: ForeignKey::logical(
                ("message", "handle_id"),
                ("handle", "ROWID"),
                Some(0),
            ),
        },
        DialectOverride::AddForeignKey {
            foreign_key: ForeignKey::logical(
                ("message", "other_handle"),
                ("handle", "ROWID"),
                Some(0),
            ),
        },
        DialectOverride::AddRequiredJoin {
            join: RequiredJoin {
                table: "message".to_string(),
                join_table: "chat_message_join".to_string(),
                join_column: "message_id".to_string(),
                exactly_one: true,
            },
        },
        DialectOverride::AddRequiredJoin {
            join: RequiredJoin {
                table: "attachment".to_string(),
                join_table: "message_attachment_join".to_string(),
                join_column: "attachment_id".to_string(),
                exactly_one: false,
            },
        },
        set_client_version("14006"),
    ];

    DialectDefinition { name: "sonoma".to_string(), macos_major: 14, base: None, overrides }
}

fn sequoia() -> DialectDefinition {
    let mut overrides = [
        ("associated_message_emoji", Text, NULL),
        ("is_pending_satellite_send", Integer, ZERO),
        ("needs_relay", Integer, ZERO),
        ("schedule_type", Integer, ZERO),
        ("schedule_state", Integer, ZERO),
        ("sent_or_received_off_grid", Integer, ZERO),
    ]
    .into_iter()
    .map(|def| add_column("message", def))
    .collect::<Vec<_>>();

    overrides.extend(
        [
            ("emoji_image_content_identifier", Text, NULL),
            ("emoji_image_short_description", Text, NULL),
            ("preview_generation_state", Integer, ZERO),
        ]
        .into_iter()
        .map(|def| add_column("attachment", def)),
    );
    overrides.push(add_index("message_idx_schedule_state", "message", &["schedule_state"]));
    overrides.push(set_client_version("15002"));

    DialectDefinition {
        name: "sequoia".to_string(),
        macos_major: 15,
        base: Some("sonoma".to_string()),
        overrides,
    }
}

fn tahoe() -> DialectDefinition {
    DialectDefinition {
        name: "tahoe".to_string(),
        macos_major: 26,
        base: Some("sequoia".to_string()),
        overrides: vec![set_client_version("26001")],
    }
}

fn guid_keyed_columns() -> Vec<ColumnSpec> {
    vec![ColumnSpec::rowid(), ColumnSpec::new("guid", Text).unique().not_null()]
}

fn properties_table() -> TableSpec {
    TableSpec::new(
        PROPERTIES_TABLE,
        vec![ColumnSpec::new("key", Text), ColumnSpec::new("value", Text)],
    )
    .with_constraint(TableConstraint::Unique(vec!["key".to_string()]))
}

fn handle_table() -> TableSpec {
    TableSpec::new(
        "handle",
        vec![
            ColumnSpec::rowid().unique(),
            ColumnSpec::new("id", Text).not_null(),
            ColumnSpec::new("country", Text),
            ColumnSpec::new("service", Text).not_null(),
            ColumnSpec::new("uncanonicalized_id", Text),
            ColumnSpec::new("person_centric_id", Text).default_value("NULL"),
        ],
    )
    .with_constraint(TableConstraint::Unique(vec!["id".to_string(), "service".to_string()]))
}

fn chat_table() -> TableSpec {
    let mut chat_columns = guid_keyed_columns();
    chat_columns.extend(columns(&[
        ("style", Integer, None),
        ("state", Integer, None),
        ("account_id", Text, None),
        ("properties", Blob, None),
        ("chat_identifier", Text, None),
        ("service_name", Text, None),
        ("room_name", Text, None),
        ("account_login", Text, None),
        ("is_archived", Integer, ZERO),
        ("last_addressed_handle", Text, None),
        ("display_name", Text, None),
        ("group_id", Text, None),
        ("is_filtered", Integer, ZERO),
        ("successful_query", Integer, ONE),
        ("engram_id", Text, None),
        ("server_change_token", Text, None),
        ("ck_sync_state", Integer, ZERO),
        ("original_group_id", Text, None),
        ("last_read_message_timestamp", Integer, ZERO),
        ("cloudkit_record_id", Text, None),
        ("last_addressed_sim_id", Text, None),
        ("is_blackholed", Integer, ZERO),
        ("syndication_date", Integer, ZERO),
        ("syndication_type", Integer, ZERO),
        ("is_recovered", Integer, ZERO),
        ("is_deleting_incoming_messages", Integer, ZERO),
        ("is_pending_review", Integer, ZERO),
    ]));
    TableSpec::new("chat", chat_columns)
}

fn message_table() -> TableSpec {
    let mut message_columns = guid_keyed_columns();
    message_columns.extend(columns(&[
        ("text", Text, None),
        ("replace", Integer, ZERO),
        ("service_center", Text, None),
        ("handle_id", Integer, ZERO),
        ("subject", Text, None),
        ("country", Text, None),
        ("attributedBody", Blob, None),
        ("version", Integer, ZERO),
        ("type", Integer, ZERO),
        ("service", Text, None),
        ("account", Text, None),
        ("account_guid", Text, None),
        ("error", Integer, ZERO),
        ("date", Integer, None),
        ("date_read", Integer, None),
        ("date_delivered", Integer, None),
        ("is_delivered", Integer, ZERO),
        ("is_finished", Integer, ZERO),
        ("is_emote", Integer, ZERO),
        ("is_from_me", Integer, ZERO),
        ("is_empty", Integer, ZERO),
        ("is_delayed", Integer, ZERO),
        ("is_auto_reply", Integer, ZERO),
        ("is_prepared", Integer, ZERO),
        ("is_read", Integer, ZERO),
        ("is_system_message", Integer, ZERO),
        ("is_sent", Integer, ZERO),
        ("has_dd_results", Integer, ZERO),
        ("is_service_message", Integer, ZERO),
        ("is_forward", Integer, ZERO),
        ("was_downgraded", Integer, ZERO),
        ("is_archive", Integer, ZERO),
        ("cache_has_attachments", Integer, ZERO),
        ("cache_roomnames", Text, None),
        ("was_data_detected", Integer, ZERO),
        ("was_deduplicated", Integer, ZERO),
        ("is_audio_message", Integer, ZERO),
        ("is_played", Integer, ZERO),
        ("date_played", Integer, None),
        ("item_type", Integer, ZERO),
        ("other_handle", Integer, ZERO),
        ("group_title", Text, None),
        ("group_action_type", Integer, ZERO),
        ("share_status", Integer, ZERO),
        ("share_direction", Integer, ZERO),
        ("is_expirable", Integer, ZERO),
        ("expire_state", Integer, ZERO),
        ("message_action_type", Integer, ZERO),
        ("message_source", Integer, ZERO),
        ("associated_message_guid", Text, NULL),
        ("associated_message_type", Integer, ZERO),
        ("balloon_bundle_id", Text, NULL),
        ("payload_data", Blob, None),
        ("expressive_send_style_id", Text, NULL),
        ("associated_message_range_location", Integer, ZERO),
        ("associated_message_range_length", Integer, ZERO),
        ("time_expressive_send_played", Integer, ZERO),
        ("message_summary_info", Blob, NULL),
        ("ck_sync_state", Integer, ZERO),
        ("ck_record_id", Text, NULL),
        ("ck_record_change_tag", Text, NULL),
        ("destination_caller_id", Text, NULL),
        ("is_corrupt", Integer, ZERO),
        ("reply_to_guid", Text, NULL),
        ("sort_id", Integer, None),
        ("is_spam", Integer, ZERO),
        ("has_unseen_mention", Integer, ZERO),
        ("thread_originator_guid", Text, NULL),
        ("thread_originator_part", Text, NULL),
        ("syndication_ranges", Text, NULL),
        ("synced_syndication_ranges", Text, NULL),
        ("was_delivered_quietly", Integer, ZERO),
        ("did_notify_recipient", Integer, ZERO),
        ("date_retracted", Integer, ZERO),
        ("date_edited", Integer, ZERO),
        ("was_detonated", Integer, ZERO),
        ("part_count", Integer, None),
        ("is_stewie", Integer, ZERO),
        ("is_kt_verified", Integer, ZERO),
        ("is_sos", Integer, ZERO),
        ("is_critical", Integer, ZERO),
        ("bia_reference_id", Text, NULL),
        ("fallback_hash", Text, NULL),
    ]));
    TableSpec::new("message", message_columns)
}

fn attachment_table() -> TableSpec {
    let mut attachment_columns = guid_keyed_columns();
    attachment_columns.extend(columns(&[
        ("created_date", Integer, ZERO),
        ("start_date", Integer, ZERO),
        ("filename", Text, None),
        ("uti", Text, None),
        ("mime_type", Text, None),
        ("transfer_state", Integer, ZERO),
        ("is_outgoing", Integer, ZERO),
        ("user_info", Blob, None),
        ("transfer_name", Text, None),
        ("total_bytes", Integer, ZERO),
        ("is_sticker", Integer, ZERO),
        ("sticker_user_info", Blob, None),
        ("attribution_info", Blob, None),
        ("hide_attachment", Integer, ZERO),
        ("ck_sync_state", Integer, ZERO),
        ("ck_server_change_token_blob", Blob, NULL),
        ("ck_record_id", Text, NULL),
    ]));
    attachment_columns.push(ColumnSpec::new("original_guid", Text).unique().not_null());
    attachment_columns.extend(columns(&[("is_commsafety_sensitive", Integer, ZERO)]));
    TableSpec::new("attachment", attachment_columns)
}

fn join_table(name: &str, left: (&str, &str), right: (&str, &str)) -> TableSpec {
    TableSpec::new(
        name,
        vec![
            ColumnSpec::new(left.0, Integer).references(left.1, "ROWID"),
            ColumnSpec::new(right.0, Integer).references(right.1, "ROWID"),
        ],
    )
    .with_constraint(TableConstraint::Unique(vec![left.0.to_string(), right.0.to_string()]))
}

fn sync_deleted_table(name: &str) -> TableSpec {
    TableSpec::new(
        name,
        vec![
            ColumnSpec::rowid().unique(),
            ColumnSpec::new("guid", Text).not_null(),
            ColumnSpec::new("recordID", Text),
        ],
    )
}

fn recoverable_join_table() -> TableSpec {
    TableSpec::new(
        "recoverable_message_part",
        vec![
            ColumnSpec::new("chat_id", Integer).references("chat", "ROWID"),
            ColumnSpec::new("message_id", Integer).references("message", "ROWID"),
            ColumnSpec::new("part_index", Integer),
            ColumnSpec::new("delete_date", Integer),
            ColumnSpec::new("part_text", Blob).not_null(),
            ColumnSpec::new("ck_sync_state", Integer).default_value("0"),
        ],
    )
    .with_constraint(TableConstraint::PrimaryKey(vec![
        "chat_id".to_string(),
        "message_id".to_string(),
        "part_index".to_string(),
    ]))
    .with_constraint(TableConstraint::Check("delete_date != 0".to_string()))
}

fn chat_recoverable_message_join_table() -> TableSpec {
    TableSpec::new(
        "chat_recoverable_message_join",
        vec![
            ColumnSpec::new("chat_id", Integer).references("chat", "ROWID"),
            ColumnSpec::new("message_id", Integer).references("message", "ROWID"),
            ColumnSpec::new("delete_date", Integer),
            ColumnSpec::new("ck_sync_state", Integer).default_value("0"),
        ],
    )
    .with_constraint(TableConstraint::PrimaryKey(vec![
        "chat_id".to_string(),
        "message_id".to_string(),
    ]))
    .with_constraint(TableConstraint::Check("delete_date != 0".to_string()))
}
