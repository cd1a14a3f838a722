//! The closed set of operations on a [`State`](crate::State).
//!
//! Adding a variant means touching every exhaustive match in the
//! workspace, starting with [`Action::kind`].

use serde::{Deserialize, Serialize};

use crate::{Coordinates, Cursor, LayerId, Rectangle, TileId, UserId};

/// An immutable edit, serialized with its variant name under `"type"`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum Action {
    FillRectangle {
        layer_ids: Vec<LayerId>,
        rectangle: Rectangle,
        tile_id: TileId,
    },
    SetSelection {
        user_id: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        selection: Option<Rectangle>,
    },
    SetCursor {
        user_id: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cursor: Option<Cursor>,
    },
    SetCursorOffset {
        user_id: UserId,
        offset: Coordinates,
    },
    PasteFromCursor {
        user_id: UserId,
        default_layer_id: LayerId,
    },
    SetLayerVisibility {
        layer_id: LayerId,
        visibility: bool,
    },
    AddUser {
        user_id: UserId,
    },
    RemoveUser {
        user_id: UserId,
    },
}

/// Payload-free tag of an [`Action`].
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionType {
    FillRectangle,
    SetSelection,
    SetCursor,
    SetCursorOffset,
    PasteFromCursor,
    SetLayerVisibility,
    AddUser,
    RemoveUser,
}

impl ActionType {
    pub const ALL: [ActionType; 8] = [
        ActionType::FillRectangle,
        ActionType::SetSelection,
        ActionType::SetCursor,
        ActionType::SetCursorOffset,
        ActionType::PasteFromCursor,
        ActionType::SetLayerVisibility,
        ActionType::AddUser,
        ActionType::RemoveUser,
    ];

    /// Wire name, identical to the `"type"` tag of the action.
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::FillRectangle => "FillRectangle",
            ActionType::SetSelection => "SetSelection",
            ActionType::SetCursor => "SetCursor",
            ActionType::SetCursorOffset => "SetCursorOffset",
            ActionType::PasteFromCursor => "PasteFromCursor",
            ActionType::SetLayerVisibility => "SetLayerVisibility",
            ActionType::AddUser => "AddUser",
            ActionType::RemoveUser => "RemoveUser",
        }
    }
}

impl Action {
    pub fn kind(&self) -> ActionType {
        match self {
            Action::FillRectangle { .. } => ActionType::FillRectangle,
            Action::SetSelection { .. } => ActionType::SetSelection,
            Action::SetCursor { .. } => ActionType::SetCursor,
            Action::SetCursorOffset { .. } => ActionType::SetCursorOffset,
            Action::PasteFromCursor { .. } => ActionType::PasteFromCursor,
            Action::SetLayerVisibility { .. } => ActionType::SetLayerVisibility,
            Action::AddUser { .. } => ActionType::AddUser,
            Action::RemoveUser { .. } => ActionType::RemoveUser,
        }
    }

    /// The user this action is about, if it is a per-user action.
    pub fn user_id(&self) -> Option<&str> {
        match self {
            Action::SetSelection { user_id, .. }
            | Action::SetCursor { user_id, .. }
            | Action::SetCursorOffset { user_id, .. }
            | Action::PasteFromCursor { user_id, .. }
            | Action::AddUser { user_id }
            | Action::RemoveUser { user_id } => Some(user_id),
            Action::FillRectangle { .. } | Action::SetLayerVisibility { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CursorContent;

    fn sample(kind: ActionType) -> Action {
        let user_id = "user-1".to_string();
        match kind {
            ActionType::FillRectangle => Action::FillRectangle {
                layer_ids: vec![1, 2],
                rectangle: Rectangle::new(0, 0, 2, 2),
                tile_id: 5,
            },
            ActionType::SetSelection => Action::SetSelection {
                user_id,
                selection: Some(Rectangle::new(1, 1, 3, 3)),
            },
            ActionType::SetCursor => Action::SetCursor {
                user_id,
                cursor: Some(Cursor {
                    frame: Rectangle::new(0, 0, 1, 1),
                    initial_frame: Rectangle::new(0, 0, 1, 1),
                    contents: vec![CursorContent { layer_id: Some(1), data: vec![3] }],
                }),
            },
            ActionType::SetCursorOffset => Action::SetCursorOffset {
                user_id,
                offset: Coordinates::new(4, 2),
            },
            ActionType::PasteFromCursor => Action::PasteFromCursor {
                user_id,
                default_layer_id: 1,
            },
            ActionType::SetLayerVisibility => Action::SetLayerVisibility {
                layer_id: 1,
                visibility: false,
            },
            ActionType::AddUser => Action::AddUser { user_id },
            ActionType::RemoveUser => Action::RemoveUser { user_id },
        }
    }

    #[test]
    fn test_every_kind_has_matching_wire_tag() {
        for kind in ActionType::ALL {
            let action = sample(kind);
            assert_eq!(action.kind(), kind);
            let json = serde_json::to_value(&action).unwrap();
            assert_eq!(json["type"], kind.as_str());
            let back: Action = serde_json::from_value(json).unwrap();
            assert_eq!(back, action);
        }
    }

    #[test]
    fn test_fields_are_camel_case() {
        let json = serde_json::to_value(sample(ActionType::FillRectangle)).unwrap();
        assert_eq!(json["layerIds"], serde_json::json!([1, 2]));
        assert_eq!(json["tileId"], 5);

        let json = serde_json::to_value(sample(ActionType::PasteFromCursor)).unwrap();
        assert_eq!(json["userId"], "user-1");
        assert_eq!(json["defaultLayerId"], 1);
    }

    #[test]
    fn test_parse_cleared_selection() {
        let action: Action =
            serde_json::from_str(r#"{"type":"SetSelection","userId":"u"}"#).unwrap();
        assert_eq!(
            action,
            Action::SetSelection { user_id: "u".into(), selection: None }
        );
    }

    #[test]
    fn test_unknown_type_rejected() {
        let result: Result<Action, _> = serde_json::from_str(r#"{"type":"Explode"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_user_id_accessor() {
        assert_eq!(sample(ActionType::AddUser).user_id(), Some("user-1"));
        assert_eq!(sample(ActionType::FillRectangle).user_id(), None);
    }
}
