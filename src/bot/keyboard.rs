//! Inline keyboards and callback data.

use crate::bot::button_text;
use crate::bot::transport::{Button, InlineKeyboard};

pub const ACTIVE_MARK: &str = "✓ ";

/// Parsed `callback_data`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Callback {
    Server(String),
    Page(usize),
    Confirm(ConfirmAction),
    Cancel,
    Quick(String),
    Menu,
    Status,
    Ping,
    Refresh,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmAction {
    Switch(String),
    Update,
}

impl Callback {
    pub fn parse(data: &str) -> Option<Self> {
        let (ns, rest) = match data.split_once(':') {
            Some((ns, rest)) => (ns, Some(rest)),
            None => (data, None),
        };
        match (ns, rest) {
            ("server", Some(id)) if !id.is_empty() => Some(Callback::Server(id.to_string())),
            ("quick", Some(id)) if !id.is_empty() => Some(Callback::Quick(id.to_string())),
            ("page", Some(n)) => n.parse().ok().map(Callback::Page),
            ("confirm", Some(action)) => match action.split_once(':') {
                Some(("switch", id)) if !id.is_empty() => {
                    Some(Callback::Confirm(ConfirmAction::Switch(id.to_string())))
                }
                None if action == "update" => Some(Callback::Confirm(ConfirmAction::Update)),
                _ => None,
            },
            ("cancel", None) => Some(Callback::Cancel),
            ("menu", None) => Some(Callback::Menu),
            ("cmd", Some("status")) => Some(Callback::Status),
            ("cmd", Some("ping")) => Some(Callback::Ping),
            ("cmd", Some("refresh")) => Some(Callback::Refresh),
            _ => None,
        }
    }

    pub fn data(&self) -> String {
        match self {
            Callback::Server(id) => format!("server:{}", id),
            Callback::Page(n) => format!("page:{}", n),
            Callback::Confirm(ConfirmAction::Switch(id)) => format!("confirm:switch:{}", id),
            Callback::Confirm(ConfirmAction::Update) => "confirm:update".to_string(),
            Callback::Cancel => "cancel".to_string(),
            Callback::Quick(id) => format!("quick:{}", id),
            Callback::Menu => "menu".to_string(),
            Callback::Status => "cmd:status".to_string(),
            Callback::Ping => "cmd:ping".to_string(),
            Callback::Refresh => "cmd:refresh".to_string(),
        }
    }
}

fn button(text: impl Into<String>, cb: Callback) -> Button {
    Button::new(text, cb.data())
}

/// A server as shown on a button.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerLabel {
    pub id: String,
    pub label: String,
    pub active: bool,
}

fn label_text(entry: &ServerLabel, max_len: usize) -> String {
    if entry.active {
        let budget = max_len.saturating_sub(button_text::display_len(ACTIVE_MARK));
        format!("{}{}", ACTIVE_MARK, button_text::fit(&entry.label, budget))
    } else {
        button_text::fit(&entry.label, max_len)
    }
}

pub fn main_menu(quick: &[ServerLabel], max_len: usize) -> InlineKeyboard {
    let mut kb = InlineKeyboard::new()
        .row(vec![
            button("📋 Серверы", Callback::Page(0)),
            button("📊 Статус", Callback::Status),
        ])
        .row(vec![
            button("📡 Пинг", Callback::Ping),
            button("🔃 Обновить", Callback::Refresh),
        ]);
    for entry in quick {
        kb = kb.row(vec![button(
            label_text(entry, max_len),
            Callback::Quick(entry.id.clone()),
        )]);
    }
    kb
}

pub fn total_pages(count: usize, per_page: usize) -> usize {
    count.div_ceil(per_page.max(1)).max(1)
}

/// One page of servers plus navigation. `page` is clamped to the last page.
pub fn server_list(
    entries: &[ServerLabel],
    page: usize,
    per_page: usize,
    max_len: usize,
) -> (InlineKeyboard, usize) {
    let per_page = per_page.max(1);
    let pages = total_pages(entries.len(), per_page);
    let page = page.min(pages - 1);

    let mut kb = InlineKeyboard::new();
    for entry in entries.iter().skip(page * per_page).take(per_page) {
        kb = kb.row(vec![button(
            label_text(entry, max_len),
            Callback::Server(entry.id.clone()),
        )]);
    }

    let mut nav = Vec::new();
    if page > 0 {
        nav.push(button("◀️", Callback::Page(page - 1)));
    }
    if pages > 1 {
        nav.push(button(format!("{}/{}", page + 1, pages), Callback::Page(page)));
    }
    if page + 1 < pages {
        nav.push(button("▶️", Callback::Page(page + 1)));
    }
    kb = kb.row(nav).row(vec![back_button()]);
    (kb, page)
}

pub fn back_button() -> Button {
    button("⬅️ Меню", Callback::Menu)
}

pub fn back_to_menu() -> InlineKeyboard {
    InlineKeyboard::new().row(vec![back_button()])
}

pub fn confirm_switch(id: &str) -> InlineKeyboard {
    InlineKeyboard::new().row(vec![
        button("✅ Да", Callback::Confirm(ConfirmAction::Switch(id.to_string()))),
        button("❌ Отмена", Callback::Cancel),
    ])
}

pub fn confirm_update() -> InlineKeyboard {
    InlineKeyboard::new().row(vec![
        button("✅ Обновить", Callback::Confirm(ConfirmAction::Update)),
        button("❌ Отмена", Callback::Cancel),
    ])
}
