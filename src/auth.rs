use ulid::Ulid;

use crate::model::{Role, User};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Member,
    /// May act on any user's reservations.
    Admin,
}

/// Who is acting, as vouched for by the identity provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub user_id: Ulid,
    pub capability: Capability,
}

impl Actor {
    pub fn member(user_id: Ulid) -> Self {
        Self {
            user_id,
            capability: Capability::Member,
        }
    }

    pub fn admin(user_id: Ulid) -> Self {
        Self {
            user_id,
            capability: Capability::Admin,
        }
    }

    pub fn for_user(user: &User) -> Self {
        match user.role {
            Role::Admin => Self::admin(user.id),
            Role::Student => Self::member(user.id),
        }
    }

    pub fn is_admin(&self) -> bool {
        self.capability == Capability::Admin
    }

    /// Owners act on their own rows; admins on anyone's.
    pub fn can_act_for(&self, owner: Ulid) -> bool {
        self.is_admin() || self.user_id == owner
    }
}
