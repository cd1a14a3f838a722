//! The state transition function shared by client and server.

use crate::cursor::paste_cursor;
use crate::{Action, Rectangle, State, TileId, User, UserId, ValidationError, World};

/// Apply `action` to `state`, returning the next state.
///
/// Never mutates its input and has no side effects, so the same sequence
/// of actions always produces the same state wherever it runs. On error
/// the caller keeps its previous state.
pub fn reduce(state: &State, action: &Action) -> Result<State, ValidationError> {
    let mut next = state.clone();
    apply(&mut next, action)?;
    debug_assert!(
        selection_and_cursor_exclusive(&next),
        "a user holds both a cursor and a selection after {:?}",
        action.kind()
    );
    Ok(next)
}

/// True when no user has both a selection and a cursor.
pub fn selection_and_cursor_exclusive(state: &State) -> bool {
    state
        .users
        .iter()
        .all(|u| !(u.selection.is_some() && u.cursor.is_some()))
}

fn require_user<'a>(state: &'a mut State, user_id: &UserId) -> Result<&'a mut User, ValidationError> {
    state
        .user_mut(user_id)
        .ok_or_else(|| ValidationError::UnknownUser(user_id.clone()))
}

fn apply(state: &mut State, action: &Action) -> Result<(), ValidationError> {
    match action {
        Action::FillRectangle {
            layer_ids,
            rectangle,
            tile_id,
        } => {
            for &layer_id in layer_ids {
                fill_rectangle(&mut state.world, layer_id, *rectangle, *tile_id)?;
            }
        }
        Action::SetSelection { user_id, selection } => {
            let user = require_user(state, user_id)?;
            user.selection = *selection;
            if selection.is_some() {
                user.cursor = None;
            }
        }
        Action::SetCursor { user_id, cursor } => {
            let user = require_user(state, user_id)?;
            user.cursor = cursor.clone();
            if cursor.is_some() {
                user.selection = None;
            }
        }
        Action::SetCursorOffset { user_id, offset } => {
            // The cursor may already be gone when a late offset update lands.
            match require_user(state, user_id)?.cursor.as_mut() {
                Some(cursor) => {
                    cursor.frame.x = offset.x;
                    cursor.frame.y = offset.y;
                }
                None => log::trace!("ignoring cursor offset for {user_id}: no cursor"),
            }
        }
        Action::PasteFromCursor {
            user_id,
            default_layer_id,
        } => {
            let cursor = require_user(state, user_id)?
                .cursor
                .clone()
                .ok_or_else(|| ValidationError::NoCursor(user_id.clone()))?;
            paste_cursor(&mut state.world, &cursor, *default_layer_id)?;
        }
        Action::SetLayerVisibility {
            layer_id,
            visibility,
        } => {
            state
                .world
                .layer_mut(*layer_id)
                .ok_or(ValidationError::UnknownLayer(*layer_id))?
                .visible = *visibility;
        }
        Action::AddUser { user_id } => {
            if state.user(user_id).is_some() {
                return Err(ValidationError::DuplicateUser(user_id.clone()));
            }
            state.users.push(User::new(user_id.clone()));
        }
        Action::RemoveUser { user_id } => {
            state.users.retain(|u| &u.id != user_id);
        }
    }
    Ok(())
}

/// Write `tile_id` into the part of `rectangle` that overlaps the layer.
fn fill_rectangle(
    world: &mut World,
    layer_id: u32,
    rectangle: Rectangle,
    tile_id: TileId,
) -> Result<(), ValidationError> {
    let layer = world.grid_layer_mut(layer_id)?;
    let Some(bounds) = layer.bounds() else {
        return Err(ValidationError::NotAGridLayer(layer_id));
    };
    let Some(overlap) = bounds.intersect(&rectangle) else {
        return Ok(());
    };
    let Some(grid) = layer.grid_mut() else {
        return Err(ValidationError::NotAGridLayer(layer_id));
    };
    let len = grid.data.len();
    for (x, y) in overlap.cells() {
        let Some(index) = bounds.local_index(x, y) else {
            continue;
        };
        let cell = grid
            .data
            .get_mut(index)
            .ok_or(ValidationError::OutOfBoundsIndex { layer_id, index, len })?;
        *cell = tile_id;
    }
    Ok(())
}
