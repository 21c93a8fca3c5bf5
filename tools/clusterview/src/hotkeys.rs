#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HotkeyBinding {
    pub key: char,
    pub action: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotkeyAction {
    Quit,
    MoveDown,
    MoveUp,
    NextView,
    EditFilter,
    ClearFilter,
    CycleStatusFilter,
    CycleTypeFilter,
    Refresh,
    ToggleAutoRefresh,
    RefreshGuest,
    Start,
    Stop,
    Shutdown,
    Restart,
    Migrate,
    Delete,
    Backup,
    Snapshot,
}

pub const NAVIGATION_BINDINGS: [HotkeyBinding; 8] = [
    HotkeyBinding {
        key: 'q',
        action: "quit",
    },
    HotkeyBinding {
        key: 'j',
        action: "down",
    },
    HotkeyBinding {
        key: 'k',
        action: "up",
    },
    HotkeyBinding {
        key: '\t',
        action: "next view",
    },
    HotkeyBinding {
        key: '/',
        action: "filter",
    },
    HotkeyBinding {
        key: 'c',
        action: "clear filter",
    },
    HotkeyBinding {
        key: 'r',
        action: "refresh",
    },
    HotkeyBinding {
        key: 'a',
        action: "auto-refresh",
    },
];

pub const GUEST_BINDINGS: [HotkeyBinding; 11] = [
    HotkeyBinding {
        key: 'f',
        action: "cycle status",
    },
    HotkeyBinding {
        key: 't',
        action: "cycle type",
    },
    HotkeyBinding {
        key: 'g',
        action: "refresh guest",
    },
    HotkeyBinding {
        key: 's',
        action: "start",
    },
    HotkeyBinding {
        key: 'S',
        action: "stop",
    },
    HotkeyBinding {
        key: 'D',
        action: "shutdown",
    },
    HotkeyBinding {
        key: 'R',
        action: "restart",
    },
    HotkeyBinding {
        key: 'm',
        action: "migrate",
    },
    HotkeyBinding {
        key: 'x',
        action: "delete",
    },
    HotkeyBinding {
        key: 'b',
        action: "backup",
    },
    HotkeyBinding {
        key: 'p',
        action: "snapshot",
    },
];

pub const FILTER_INPUT_LEGEND: &str = "Type to filter  Enter apply  Esc cancel";

pub fn dashboard_controls_legend(guest_view: bool) -> String {
    let mut bindings = NAVIGATION_BINDINGS.to_vec();
    if guest_view {
        bindings.extend(GUEST_BINDINGS);
    }
    format_bindings("Keys: ", &bindings)
}

/// Guest actions only resolve while the guest view is active.
pub fn action_for_key(key: char, guest_view: bool) -> Option<HotkeyAction> {
    match key {
        'q' => Some(HotkeyAction::Quit),
        'j' => Some(HotkeyAction::MoveDown),
        'k' => Some(HotkeyAction::MoveUp),
        '\t' => Some(HotkeyAction::NextView),
        '/' => Some(HotkeyAction::EditFilter),
        'c' => Some(HotkeyAction::ClearFilter),
        'r' => Some(HotkeyAction::Refresh),
        'a' => Some(HotkeyAction::ToggleAutoRefresh),
        'f' if guest_view => Some(HotkeyAction::CycleStatusFilter),
        't' if guest_view => Some(HotkeyAction::CycleTypeFilter),
        'g' if guest_view => Some(HotkeyAction::RefreshGuest),
        's' if guest_view => Some(HotkeyAction::Start),
        'S' if guest_view => Some(HotkeyAction::Stop),
        'D' if guest_view => Some(HotkeyAction::Shutdown),
        'R' if guest_view => Some(HotkeyAction::Restart),
        'm' if guest_view => Some(HotkeyAction::Migrate),
        'x' if guest_view => Some(HotkeyAction::Delete),
        'b' if guest_view => Some(HotkeyAction::Backup),
        'p' if guest_view => Some(HotkeyAction::Snapshot),
        _ => None,
    }
}

fn key_label(key: char) -> String {
    match key {
        '\t' => "tab".to_string(),
        other => other.to_string(),
    }
}

fn format_bindings(prefix: &str, bindings: &[HotkeyBinding]) -> String {
    let parts = bindings
        .iter()
        .map(|binding| format!("{} {}", key_label(binding.key), binding.action))
        .collect::<Vec<_>>();
    format!("{prefix}{}", parts.join("  "))
}
