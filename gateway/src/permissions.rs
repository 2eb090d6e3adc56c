use crate::users::{Role, TeamMembership, TeamRole};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    /// Super-permission sentinel; grants everything.
    All,
    KeysCreate,
    KeysRead,
    KeysRevoke,
    TeamsRead,
    TeamsManage,
    UsersManage,
    UsageRead,
    BudgetsManage,
    ModelsInvoke,
    AuditRead,
    CacheFlush,
}

// Which permissions each global role grants.
fn role_permissions(role: Role) -> &'static [Permission] {
    use Permission::*;
    match role {
        Role::Admin => &[All],
        Role::Manager => &[
            KeysCreate, KeysRead, KeysRevoke, TeamsRead, TeamsManage, UsageRead, BudgetsManage,
            ModelsInvoke, AuditRead,
        ],
        Role::User => &[KeysCreate, KeysRead, KeysRevoke, TeamsRead, UsageRead, ModelsInvoke],
        Role::Viewer => &[KeysRead, TeamsRead, UsageRead],
    }
}

// Which permissions a team-scoped role grants within that team.
fn team_role_permissions(role: TeamRole) -> &'static [Permission] {
    use Permission::*;
    match role {
        TeamRole::Owner => &[All],
        TeamRole::Admin => &[
            KeysCreate, KeysRead, KeysRevoke, TeamsRead, TeamsManage, UsageRead, BudgetsManage,
            ModelsInvoke,
        ],
        TeamRole::Member => &[KeysCreate, KeysRead, TeamsRead, UsageRead, ModelsInvoke],
        TeamRole::Viewer => &[KeysRead, TeamsRead, UsageRead],
    }
}

/// Effective-permission queries over the static role maps. Role changes
/// propagate on the next login and the next auth-cache miss; nothing here
/// is stored per user.
#[derive(Debug, Clone, Copy, Default)]
pub struct PermissionEngine;

impl PermissionEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn has_permission(&self, role: Role, permission: Permission) -> bool {
        let granted = role_permissions(role);
        granted.contains(&Permission::All) || granted.contains(&permission)
    }

    /// Global permission, or one granted by the user's role in `team_id`.
    pub fn has_team_permission(
        &self,
        role: Role,
        memberships: &[TeamMembership],
        team_id: Uuid,
        permission: Permission,
    ) -> bool {
        if self.has_permission(role, permission) {
            return true;
        }
        memberships
            .iter()
            .filter(|m| m.team_id == team_id)
            .any(|m| {
                let granted = team_role_permissions(m.role);
                granted.contains(&Permission::All) || granted.contains(&permission)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn membership(team_id: Uuid, role: TeamRole) -> TeamMembership {
        TeamMembership { team_id, role }
    }

    #[test]
    fn admin_has_everything_via_sentinel() {
        let engine = PermissionEngine::new();
        for p in [
            Permission::KeysCreate,
            Permission::UsersManage,
            Permission::AuditRead,
            Permission::CacheFlush,
        ] {
            assert!(engine.has_permission(Role::Admin, p));
        }
    }

    #[test]
    fn viewer_cannot_create_keys() {
        let engine = PermissionEngine::new();
        assert!(!engine.has_permission(Role::Viewer, Permission::KeysCreate));
        assert!(engine.has_permission(Role::Viewer, Permission::UsageRead));
    }

    #[test]
    fn team_role_grants_within_its_team_only() {
        let engine = PermissionEngine::new();
        let team_a = Uuid::new_v4();
        let team_b = Uuid::new_v4();
        let memberships = vec![membership(team_a, TeamRole::Admin)];

        assert!(engine.has_team_permission(
            Role::Viewer,
            &memberships,
            team_a,
            Permission::TeamsManage
        ));
        assert!(!engine.has_team_permission(
            Role::Viewer,
            &memberships,
            team_b,
            Permission::TeamsManage
        ));
    }

    #[test]
    fn global_permission_wins_without_membership() {
        let engine = PermissionEngine::new();
        let team = Uuid::new_v4();
        assert!(engine.has_team_permission(Role::Admin, &[], team, Permission::TeamsManage));
    }

    #[test]
    fn team_owner_gets_sentinel() {
        let engine = PermissionEngine::new();
        let team = Uuid::new_v4();
        let memberships = vec![membership(team, TeamRole::Owner)];
        assert!(engine.has_team_permission(
            Role::User,
            &memberships,
            team,
            Permission::BudgetsManage
        ));
    }
}
