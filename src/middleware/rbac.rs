use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use serde::{Deserialize, Serialize};

use crate::errors::AppError;

/// Roles an operator can act under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Editor,
    Viewer,
}

impl Role {
    /// Unknown role names fall back to the least-privileged role.
    pub fn from_str(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "admin" => Role::Admin,
            "editor" => Role::Editor,
            _ => Role::Viewer,
        }
    }

    /// Check if this role has the required permission level.
    pub fn has_permission(&self, required: &Permission) -> bool {
        match required {
            Permission::Read => true, // all roles can read
            Permission::Write => matches!(self, Role::Admin | Role::Editor),
            Permission::Privileged => matches!(self, Role::Admin),
        }
    }
}

/// Permission levels for RBAC enforcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Read,
    Write,
    /// Admin override on association, cross-product visibility.
    Privileged,
}

/// Who is performing an operation. Authentication happens upstream;
/// this only carries the resolved identity and role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub role: Role,
}

impl Actor {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self { id: id.into(), role }
    }

    pub fn admin(id: impl Into<String>) -> Self {
        Self::new(id, Role::Admin)
    }

    pub fn editor(id: impl Into<String>) -> Self {
        Self::new(id, Role::Editor)
    }

    pub fn viewer(id: impl Into<String>) -> Self {
        Self::new(id, Role::Viewer)
    }

    pub fn is_privileged(&self) -> bool {
        self.role.has_permission(&Permission::Privileged)
    }

    pub fn require(&self, permission: Permission) -> Result<(), AppError> {
        if self.role.has_permission(&permission) {
            Ok(())
        } else {
            tracing::warn!(actor = %self.id, role = ?self.role, ?permission, "rbac: insufficient role");
            Err(AppError::forbidden(format!(
                "role '{:?}' lacks {:?} permission",
                self.role, permission
            )))
        }
    }
}

/// Reads `X-Actor-Id` / `X-Actor-Role` set by the admin auth layer's caller.
/// Missing headers resolve to an anonymous viewer.
#[async_trait]
impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(String::from)
        };

        let id = header("x-actor-id").unwrap_or_else(|| "anonymous".to_string());
        let role = header("x-actor-role")
            .map(|r| Role::from_str(&r))
            .unwrap_or(Role::Viewer);

        Ok(Actor { id, role })
    }
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_from_str() {
        assert_eq!(Role::from_str("admin"), Role::Admin);
        assert_eq!(Role::from_str("Admin"), Role::Admin);
        assert_eq!(Role::from_str("editor"), Role::Editor);
        assert_eq!(Role::from_str("viewer"), Role::Viewer);
        assert_eq!(Role::from_str("superuser"), Role::Viewer);
    }

    #[test]
    fn test_admin_has_all_permissions() {
        let admin = Role::Admin;
        assert!(admin.has_permission(&Permission::Read));
        assert!(admin.has_permission(&Permission::Write));
        assert!(admin.has_permission(&Permission::Privileged));
    }

    #[test]
    fn test_editor_has_read_write() {
        let editor = Role::Editor;
        assert!(editor.has_permission(&Permission::Read));
        assert!(editor.has_permission(&Permission::Write));
        assert!(!editor.has_permission(&Permission::Privileged));
    }

    #[test]
    fn test_viewer_has_read_only() {
        let viewer = Role::Viewer;
        assert!(viewer.has_permission(&Permission::Read));
        assert!(!viewer.has_permission(&Permission::Write));
        assert!(!viewer.has_permission(&Permission::Privileged));
    }

    #[test]
    fn test_require_returns_forbidden() {
        let err = Actor::viewer("v1").require(Permission::Write).unwrap_err();
        assert_eq!(err.code(), "forbidden");
        assert!(Actor::editor("e1").require(Permission::Write).is_ok());
        assert!(!Actor::editor("e1").is_privileged());
        assert!(Actor::admin("a1").is_privileged());
    }
}
