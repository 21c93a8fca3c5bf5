use crate::engine::{EngineHandle, StatusMessage, ViewSnapshot};
use crate::errors::ClusterViewError;
use crate::filter::cycle_option;
use crate::hotkeys::{action_for_key, HotkeyAction};
use crate::model::{Entity, Guest, GuestType, ViewKind};
use crate::operations::GuestAction;
use crate::runtime::Clock;
use crate::tui::InputState;
use std::time::UNIX_EPOCH;

/// Terminal-independent key press.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyInput {
    Char(char),
    Tab,
    Up,
    Down,
    Enter,
    Esc,
    Backspace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFlow {
    Continue,
    Quit,
}

/// Translates one key press into engine intents. `view` is the latest frame
/// the terminal has drawn. Rejections the engine already reported as a
/// status message are not returned as errors.
pub fn handle_key(
    engine: &EngineHandle,
    view: &ViewSnapshot,
    input: &mut InputState,
    key: KeyInput,
    clock: &dyn Clock,
) -> Result<KeyFlow, ClusterViewError> {
    if let Some(draft) = input.filter_draft.as_mut() {
        match key {
            KeyInput::Char(c) => draft.push(c),
            KeyInput::Backspace => {
                draft.pop();
            }
            KeyInput::Enter => {
                let text = draft.trim().to_string();
                input.filter_draft = None;
                engine.set_text_filter(view.active_view, text)?;
            }
            KeyInput::Esc => input.filter_draft = None,
            _ => {}
        }
        return Ok(KeyFlow::Continue);
    }

    let as_char = match key {
        KeyInput::Char(c) => c,
        KeyInput::Tab => '\t',
        KeyInput::Down => 'j',
        KeyInput::Up => 'k',
        KeyInput::Enter | KeyInput::Esc | KeyInput::Backspace => {
            input.quit_armed = false;
            return Ok(KeyFlow::Continue);
        }
    };
    let Some(action) = action_for_key(as_char, view.active_view == ViewKind::Guests) else {
        return Ok(KeyFlow::Continue);
    };
    if action != HotkeyAction::Quit {
        input.quit_armed = false;
    }

    let kind = view.active_view;
    let result = match action {
        HotkeyAction::Quit => {
            if view.console_sessions > 0 && !input.quit_armed {
                input.quit_armed = true;
                return Ok(KeyFlow::Continue);
            }
            return Ok(KeyFlow::Quit);
        }
        HotkeyAction::MoveDown => engine.move_cursor(kind, 1).map(|_| ()),
        HotkeyAction::MoveUp => engine.move_cursor(kind, -1).map(|_| ()),
        HotkeyAction::NextView => engine.set_active_view(kind.next()),
        HotkeyAction::EditFilter => {
            input.filter_draft = Some(view.filter(kind).text);
            Ok(())
        }
        HotkeyAction::ClearFilter => engine.clear_filter(kind),
        HotkeyAction::CycleStatusFilter => {
            let mut structured = view.filter(kind).structured;
            structured.status = cycle_option(&structured.status, &view.guest_statuses);
            engine.set_structured_filter(kind, structured).map(|_| ())
        }
        HotkeyAction::CycleTypeFilter => {
            let mut structured = view.filter(kind).structured;
            let guest_types = [GuestType::Qemu, GuestType::Lxc]
                .map(|guest_type| guest_type.as_str().to_string());
            structured.kind = cycle_option(&structured.kind, &guest_types);
            engine.set_structured_filter(kind, structured).map(|_| ())
        }
        HotkeyAction::Refresh => engine.request_manual_refresh().map(|_| ()),
        HotkeyAction::ToggleAutoRefresh => {
            if view.refresh.enabled {
                engine.stop_auto_refresh()
            } else {
                engine.start_auto_refresh(view.refresh.interval)
            }
        }
        HotkeyAction::RefreshGuest => match view.focused_guest() {
            Some(guest) => engine.refresh_guest(guest.key()),
            None => Ok(()),
        },
        guest_action => match view.focused_guest() {
            Some(guest) => match guest_action_for(guest_action, guest, view, clock) {
                Ok(action) => engine.dispatch(guest.key(), action),
                Err(err) => Err(err),
            },
            None => Ok(()),
        },
    };

    match result {
        Ok(()) => Ok(KeyFlow::Continue),
        Err(ClusterViewError::Shutdown) => Err(ClusterViewError::Shutdown),
        Err(ClusterViewError::Busy { .. }) => Ok(KeyFlow::Continue),
        Err(err) => {
            engine.show_message(StatusMessage::warn(err.to_string()))?;
            Ok(KeyFlow::Continue)
        }
    }
}

fn guest_action_for(
    action: HotkeyAction,
    guest: &Guest,
    view: &ViewSnapshot,
    clock: &dyn Clock,
) -> Result<GuestAction, ClusterViewError> {
    Ok(match action {
        HotkeyAction::Start => GuestAction::Start,
        HotkeyAction::Stop => GuestAction::Stop,
        HotkeyAction::Shutdown => GuestAction::Shutdown,
        HotkeyAction::Restart => GuestAction::Restart,
        HotkeyAction::Migrate => GuestAction::Migrate {
            target: migration_target(guest, view)?,
            online: guest.is_running(),
        },
        HotkeyAction::Delete => GuestAction::Delete { force: false },
        HotkeyAction::Backup => GuestAction::Backup {
            storage: "local".to_string(),
        },
        HotkeyAction::Snapshot => {
            let stamp = clock
                .now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_secs())
                .unwrap_or_default();
            GuestAction::Snapshot {
                name: format!("clusterview-{stamp}"),
            }
        }
        other => {
            return Err(ClusterViewError::Cli(format!(
                "{other:?} is not a guest action"
            )))
        }
    })
}

/// First online node after the guest's current node, wrapping around.
pub fn migration_target(guest: &Guest, view: &ViewSnapshot) -> Result<String, ClusterViewError> {
    let nodes = view
        .all_nodes
        .iter()
        .filter(|node| node.profile == guest.profile)
        .collect::<Vec<_>>();
    let start = nodes
        .iter()
        .position(|node| node.name == guest.node)
        .map_or(0, |idx| idx + 1);
    (0..nodes.len())
        .map(|offset| nodes[(start + offset) % nodes.len()])
        .find(|node| node.online && node.name != guest.node)
        .map(|node| node.name.clone())
        .ok_or_else(|| {
            ClusterViewError::NotFound(format!("online node to migrate {} to", guest.name))
        })
}
