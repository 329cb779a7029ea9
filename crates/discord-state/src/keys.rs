//! Cache key layout. Other services read the same database, so these formats are
//! part of the external contract.

pub fn guild(guild_id: &str) -> String {
    format!("guild:{guild_id}")
}

pub fn member(guild_id: &str, user_id: &str) -> String {
    format!("guild:{guild_id}:member:{user_id}")
}

pub fn roles(guild_id: &str) -> String {
    format!("guild:{guild_id}:roles")
}

pub fn role(guild_id: &str, role_id: &str) -> String {
    format!("guild:{guild_id}:role:{role_id}")
}

pub fn user(user_id: &str) -> String {
    format!("user:{user_id}")
}

/// Single-flight key for a member list request. Order and duplicates in `user_ids`
/// do not change the key.
pub fn member_request(guild_id: &str, user_ids: &[String]) -> String {
    let mut ids: Vec<&str> = user_ids.iter().map(String::as_str).collect();
    ids.sort_unstable();
    ids.dedup();
    format!("guild:{guild_id}:members_request:{}", ids.join(","))
}
