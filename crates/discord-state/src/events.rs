//! Typed gateway change notifications that drive cache invalidation.
//!
//! Only the dispatches that touch cached entities are modelled; each variant carries
//! just what the corresponding cache write needs.

use serde::Deserialize;
use serde_json::Value;

use crate::model::{Guild, Member, Role, Snowflake, User, snowflake_list};

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    /// `GUILD_CREATE` / `GUILD_UPDATE`.
    GuildUpdated(Guild),
    /// `GUILD_DELETE`.
    GuildDeleted { guild_id: Snowflake },
    /// `GUILD_MEMBER_ADD` / `GUILD_MEMBER_UPDATE`.
    MemberUpdated { guild_id: Snowflake, member: Member },
    /// `GUILD_MEMBERS_CHUNK`, the reply to a member request.
    MembersChunk {
        guild_id: Snowflake,
        members: Vec<Member>,
        not_found: Vec<Snowflake>,
    },
    /// `GUILD_MEMBER_REMOVE`.
    MemberRemoved { guild_id: Snowflake, user_id: Snowflake },
    /// `GUILD_ROLE_CREATE` / `GUILD_ROLE_UPDATE`.
    RoleUpserted { guild_id: Snowflake, role: Role },
    /// `GUILD_ROLE_DELETE`.
    RoleDeleted { guild_id: Snowflake, role_id: Snowflake },
}

/// Fields of a `GUILD_CREATE` payload that are never stored on the guild document.
const GUILD_CREATE_BULK_FIELDS: &[&str] = &[
    "members",
    "channels",
    "threads",
    "presences",
    "voice_states",
    "stage_instances",
    "guild_scheduled_events",
    "soundboard_sounds",
];

#[derive(Deserialize)]
struct GuildDeletePayload {
    id: Snowflake,
}

#[derive(Deserialize)]
struct MemberPayload {
    guild_id: Snowflake,
    #[serde(flatten)]
    member: Member,
}

#[derive(Deserialize)]
struct MembersChunkPayload {
    guild_id: Snowflake,
    #[serde(default)]
    members: Vec<Member>,
    #[serde(default, deserialize_with = "snowflake_list")]
    not_found: Vec<Snowflake>,
}

#[derive(Deserialize)]
struct MemberRemovePayload {
    guild_id: Snowflake,
    user: User,
}

#[derive(Deserialize)]
struct RolePayload {
    guild_id: Snowflake,
    role: Role,
}

#[derive(Deserialize)]
struct RoleDeletePayload {
    guild_id: Snowflake,
    role_id: Snowflake,
}

impl GatewayEvent {
    /// Short name used in logs and metric labels.
    pub fn name(&self) -> &'static str {
        match self {
            GatewayEvent::GuildUpdated(_) => "guild_updated",
            GatewayEvent::GuildDeleted { .. } => "guild_deleted",
            GatewayEvent::MemberUpdated { .. } => "member_updated",
            GatewayEvent::MembersChunk { .. } => "members_chunk",
            GatewayEvent::MemberRemoved { .. } => "member_removed",
            GatewayEvent::RoleUpserted { .. } => "role_upserted",
            GatewayEvent::RoleDeleted { .. } => "role_deleted",
        }
    }

    pub fn guild_id(&self) -> &str {
        match self {
            GatewayEvent::GuildUpdated(guild) => &guild.id,
            GatewayEvent::GuildDeleted { guild_id }
            | GatewayEvent::MemberUpdated { guild_id, .. }
            | GatewayEvent::MembersChunk { guild_id, .. }
            | GatewayEvent::MemberRemoved { guild_id, .. }
            | GatewayEvent::RoleUpserted { guild_id, .. }
            | GatewayEvent::RoleDeleted { guild_id, .. } => guild_id,
        }
    }

    /// Translate a gateway dispatch (opcode 0) into cache events.
    ///
    /// Unknown dispatch types yield no events. `GUILD_CREATE` yields the guild and,
    /// when the payload carries members, a chunk for them.
    pub fn from_dispatch(event_type: &str, data: Value) -> Result<Vec<Self>, serde_json::Error> {
        let events = match event_type {
            "GUILD_CREATE" => return Self::from_guild_create(data),
            "GUILD_UPDATE" => vec![GatewayEvent::GuildUpdated(serde_json::from_value(data)?)],
            "GUILD_DELETE" => {
                let payload: GuildDeletePayload = serde_json::from_value(data)?;
                vec![GatewayEvent::GuildDeleted {
                    guild_id: payload.id,
                }]
            }
            "GUILD_MEMBER_ADD" | "GUILD_MEMBER_UPDATE" => {
                let payload: MemberPayload = serde_json::from_value(data)?;
                vec![GatewayEvent::MemberUpdated {
                    guild_id: payload.guild_id,
                    member: payload.member,
                }]
            }
            "GUILD_MEMBERS_CHUNK" => {
                let payload: MembersChunkPayload = serde_json::from_value(data)?;
                vec![GatewayEvent::MembersChunk {
                    guild_id: payload.guild_id,
                    members: payload.members,
                    not_found: payload.not_found,
                }]
            }
            "GUILD_MEMBER_REMOVE" => {
                let payload: MemberRemovePayload = serde_json::from_value(data)?;
                vec![GatewayEvent::MemberRemoved {
                    guild_id: payload.guild_id,
                    user_id: payload.user.id,
                }]
            }
            "GUILD_ROLE_CREATE" | "GUILD_ROLE_UPDATE" => {
                let payload: RolePayload = serde_json::from_value(data)?;
                vec![GatewayEvent::RoleUpserted {
                    guild_id: payload.guild_id,
                    role: payload.role,
                }]
            }
            "GUILD_ROLE_DELETE" => {
                let payload: RoleDeletePayload = serde_json::from_value(data)?;
                vec![GatewayEvent::RoleDeleted {
                    guild_id: payload.guild_id,
                    role_id: payload.role_id,
                }]
            }
            _ => Vec::new(),
        };
        Ok(events)
    }

    fn from_guild_create(mut data: Value) -> Result<Vec<Self>, serde_json::Error> {
        // Unavailable guilds (outages) carry only an id.
        if data.get("unavailable").and_then(Value::as_bool) == Some(true) {
            return Ok(Vec::new());
        }

        let members: Vec<Member> = match data.get_mut("members").map(Value::take) {
            Some(members) if !members.is_null() => serde_json::from_value(members)?,
            _ => Vec::new(),
        };
        if let Some(object) = data.as_object_mut() {
            for field in GUILD_CREATE_BULK_FIELDS {
                object.remove(*field);
            }
        }

        let guild: Guild = serde_json::from_value(data)?;
        let mut events = Vec::with_capacity(2);
        if !members.is_empty() {
            events.push(GatewayEvent::MembersChunk {
                guild_id: guild.id.clone(),
                members,
                not_found: Vec::new(),
            });
        }
        events.insert(0, GatewayEvent::GuildUpdated(guild));
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn member_update_keeps_member_fields() {
        let events = GatewayEvent::from_dispatch(
            "GUILD_MEMBER_UPDATE",
            json!({
                "guild_id": "123",
                "user": {"id": "555", "username": "alice"},
                "nick": "Al",
                "roles": ["999"],
                "joined_at": "2024-01-01T00:00:00+00:00"
            }),
        )
        .unwrap();

        match events.as_slice() {
            [GatewayEvent::MemberUpdated { guild_id, member }] => {
                assert_eq!(guild_id, "123");
                assert_eq!(member.user_id(), Some("555"));
                assert_eq!(member.nick.as_deref(), Some("Al"));
                assert!(!member.extra.contains_key("guild_id"));
            }
            other => panic!("unexpected events {other:?}"),
        }
    }

    #[test]
    fn members_chunk_collects_not_found_ids() {
        let events = GatewayEvent::from_dispatch(
            "GUILD_MEMBERS_CHUNK",
            json!({
                "guild_id": "123",
                "members": [{"user": {"id": "1", "username": "a"}, "roles": []}],
                "chunk_index": 0,
                "chunk_count": 1,
                "not_found": ["2", 3]
            }),
        )
        .unwrap();

        assert_eq!(
            events[0],
            GatewayEvent::MembersChunk {
                guild_id: "123".into(),
                members: vec![
                    serde_json::from_value(
                        json!({"user": {"id": "1", "username": "a"}, "roles": []})
                    )
                    .unwrap()
                ],
                not_found: vec!["2".into(), "3".into()],
            }
        );
    }

    #[test]
    fn role_and_removal_events() {
        let upsert = GatewayEvent::from_dispatch(
            "GUILD_ROLE_CREATE",
            json!({"guild_id": "1", "role": {"id": "9", "name": "Mod", "color": 255}}),
        )
        .unwrap();
        assert_eq!(upsert[0].name(), "role_upserted");
        assert_eq!(upsert[0].guild_id(), "1");

        let deleted = GatewayEvent::from_dispatch(
            "GUILD_ROLE_DELETE",
            json!({"guild_id": "1", "role_id": "9"}),
        )
        .unwrap();
        assert_eq!(
            deleted,
            vec![GatewayEvent::RoleDeleted {
                guild_id: "1".into(),
                role_id: "9".into()
            }]
        );

        let removed = GatewayEvent::from_dispatch(
            "GUILD_MEMBER_REMOVE",
            json!({"guild_id": "1", "user": {"id": "5", "username": "bob"}}),
        )
        .unwrap();
        assert_eq!(
            removed,
            vec![GatewayEvent::MemberRemoved {
                guild_id: "1".into(),
                user_id: "5".into()
            }]
        );
    }

    #[test]
    fn guild_create_splits_members_and_drops_bulk_fields() {
        let events = GatewayEvent::from_dispatch(
            "GUILD_CREATE",
            json!({
                "id": "123",
                "name": "Typical",
                "roles": [{"id": "123", "name": "@everyone"}],
                "channels": [{"id": "1"}],
                "members": [{"user": {"id": "555", "username": "alice"}, "roles": []}],
                "member_count": 1
            }),
        )
        .unwrap();

        assert_eq!(events.len(), 2);
        match &events[0] {
            GatewayEvent::GuildUpdated(guild) => {
                assert_eq!(guild.roles.len(), 1);
                assert!(!guild.extra.contains_key("channels"));
                assert!(!guild.extra.contains_key("members"));
                assert_eq!(guild.extra.get("member_count"), Some(&json!(1)));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            &events[1],
            GatewayEvent::MembersChunk { members, .. } if members.len() == 1
        ));
    }

    #[test]
    fn unavailable_guild_and_unknown_dispatches_are_ignored() {
        let outage =
            GatewayEvent::from_dispatch("GUILD_CREATE", json!({"id": "1", "unavailable": true}))
                .unwrap();
        assert!(outage.is_empty());

        let typing = GatewayEvent::from_dispatch("TYPING_START", json!({})).unwrap();
        assert!(typing.is_empty());
    }

    #[test]
    fn malformed_payload_is_an_error() {
        assert!(
            GatewayEvent::from_dispatch("GUILD_ROLE_DELETE", json!({"guild_id": "1"})).is_err()
        );
    }
}
