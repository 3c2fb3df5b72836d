//! Status-bar colours per team.

/// A tmux status-bar colour pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Theme {
    pub name: &'static str,
    pub bg: &'static str,
    pub fg: &'static str,
}

/// Town-level sessions (mayor, deacon).
pub const TOWN_THEME: Theme = Theme {
    name: "town",
    bg: "colour94",
    fg: "colour230",
};

pub const PALETTE: [Theme; 8] = [
    Theme { name: "ocean", bg: "colour24", fg: "colour255" },
    Theme { name: "forest", bg: "colour22", fg: "colour255" },
    Theme { name: "rust", bg: "colour130", fg: "colour255" },
    Theme { name: "plum", bg: "colour54", fg: "colour255" },
    Theme { name: "slate", bg: "colour238", fg: "colour255" },
    Theme { name: "ember", bg: "colour88", fg: "colour255" },
    Theme { name: "teal", bg: "colour30", fg: "colour255" },
    Theme { name: "sand", bg: "colour180", fg: "colour16" },
];

/// Pick a theme for a team. Stable across processes for the same name.
pub fn assign_theme(team: Option<&str>) -> Theme {
    match team {
        None | Some("") => TOWN_THEME,
        Some(team) => {
            // FNV-1a; std's hasher is randomly seeded per process
            let hash = team.bytes().fold(0xcbf2_9ce4_8422_2325_u64, |h, b| {
                (h ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
            });
            PALETTE[(hash % PALETTE.len() as u64) as usize]
        }
    }
}

/// Status-left label shown in the bar.
pub fn status_label(role: &str, team: Option<&str>, worker: Option<&str>) -> String {
    match (team, worker) {
        (Some(team), Some(worker)) => format!(" {}/{} ({}) ", team, worker, role),
        (Some(team), None) => format!(" {} ({}) ", team, role),
        _ => format!(" gastown ({}) ", role),
    }
}
