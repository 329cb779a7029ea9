use std::sync::Arc;

use crate::context::RequestContext;
use crate::error::{EntityKind, StateResult};
use crate::keys;
use crate::model::User;
use crate::state::{ReadThrough, StateManager};

impl StateManager {
    pub async fn user(&self, ctx: &RequestContext, user_id: &str) -> StateResult<User> {
        let plan =
            ReadThrough::document(EntityKind::User, keys::user(user_id), self.inner.ttl.user);
        let api = Arc::clone(&self.inner.api);
        let user_id = user_id.to_string();

        self.read_through(ctx, &self.inner.users, plan, move || async move {
            api.user(&user_id).await
        })
        .await
    }
}
