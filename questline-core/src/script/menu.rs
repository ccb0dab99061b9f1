//! Dialog and GUI menus.
//!
//! Opening a menu filters its choices by their condition groups, issues a
//! token and renders the first page. Scrolling re-renders the same menu
//! under the same token. Dialog menus mirror the speaker line into the
//! session's dialog history once per opening.

use tracing::{debug, warn};

use crate::definition::{MenuSpec, NodeKind};
use crate::error::{QuestError, Result};
use crate::host::{Host, MenuEntry, MenuStyle, MenuView};
use crate::types::NodeRef;

use super::goto::Resolution;
use super::run::{Entry, Flow};
use super::session::{OpenMenu, Pending, Session};
use super::{QuestEngine, Scope};

impl QuestEngine {
    pub(crate) fn open_menu(
        &mut self,
        session: &mut Session,
        at: &NodeRef,
        menu: &MenuSpec,
        style: MenuStyle,
        host: &mut dyn Host,
    ) -> Flow {
        let visible: Vec<usize> = {
            let scope = Scope {
                player: session.player,
                quest: Some(&session.quest),
                state: self.cache.peek(session.player),
                server: self.cache.server(),
                host: &*host,
            };
            let rng = &mut self.rng;
            menu.choices
                .iter()
                .enumerate()
                .filter(|(_, choice)| scope.all_groups(&choice.conditions, rng))
                .map(|(i, _)| i)
                .collect()
        };
        if visible.is_empty() {
            warn!(quest = %session.quest, node = %at, "Menu has no visible choices; following goto");
            return Flow::Next(None);
        }

        let stale: Vec<u64> = session
            .pending
            .iter()
            .filter(|(_, p)| matches!(p, Pending::Menu(m) if m.branch == at.branch))
            .map(|(t, _)| *t)
            .collect();
        for token in &stale {
            session.pending.remove(token);
        }
        self.release_tokens(&stale);

        let token = self.issue_token(session.player, &session.quest);
        session.pending.insert(
            token,
            Pending::Menu(OpenMenu {
                branch: at.branch.clone(),
                node: at.node.clone(),
                style,
                visible,
                page: 0,
            }),
        );
        if style == MenuStyle::Dialog {
            let text = self.interpolate(session.player, &session.quest, &*host, &menu.text);
            let line = match &menu.speaker {
                Some(speaker) => format!("{speaker}: {text}"),
                None => text,
            };
            session.mirror_dialog(&line);
        }
        self.render_menu(session, token, host);
        Flow::Suspend
    }

    /// Show the current page of an open menu.
    fn render_menu(&self, session: &Session, token: u64, host: &mut dyn Host) -> bool {
        let Some(Pending::Menu(open)) = session.pending.get(&token) else {
            return false;
        };
        let Some(spec) = menu_spec(session, open) else {
            return false;
        };
        let page_size = self.config.interpreter.menu_page_size.max(1);
        let pages = open.visible.len().div_ceil(page_size).max(1);
        let page = open.page.min(pages - 1);

        let scope = self.scope(session.player, Some(&session.quest), &*host);
        let entries: Vec<MenuEntry> = open
            .visible
            .iter()
            .skip(page * page_size)
            .take(page_size)
            .filter_map(|&index| {
                spec.choices.get(index).map(|choice| MenuEntry {
                    text: scope.interpolate(&choice.text),
                    token,
                    index,
                })
            })
            .collect();
        let view = MenuView {
            style: open.style,
            speaker: spec.speaker.as_deref().map(|s| scope.interpolate(s)),
            text: scope.interpolate(&spec.text),
            entries,
            page,
            pages,
            history: if open.style == MenuStyle::Dialog {
                session.dialog_history.clone()
            } else {
                Vec::new()
            },
        };
        host.show_menu(session.player, &view);
        true
    }

    /// Move an open menu by `delta` pages.
    pub(crate) fn scroll(&mut self, session: &mut Session, token: u64, delta: i64, host: &mut dyn Host) -> Result<()> {
        let page_size = self.config.interpreter.menu_page_size.max(1);
        let Some(Pending::Menu(open)) = session.pending.get_mut(&token) else {
            return Err(QuestError::UnknownToken(token));
        };
        let pages = open.visible.len().div_ceil(page_size).max(1);
        let target = i64::try_from(open.page).unwrap_or(i64::MAX).saturating_add(delta);
        open.page = usize::try_from(target.max(0)).unwrap_or(0).min(pages - 1);
        self.render_menu(session, token, host);
        Ok(())
    }

    /// Apply a menu selection.
    pub(crate) fn choose(&mut self, session: &mut Session, token: u64, index: usize, host: &mut dyn Host) -> Result<()> {
        let open = match session.pending.get(&token) {
            Some(Pending::Menu(open)) => open.clone(),
            _ => return Err(QuestError::UnknownToken(token)),
        };
        if !open.visible.contains(&index) {
            return Err(QuestError::InvalidChoice { index });
        }
        let Some(choice) = menu_spec(session, &open).and_then(|spec| spec.choices.get(index).cloned()) else {
            return Err(QuestError::InvalidChoice { index });
        };
        session.pending.remove(&token);
        self.release_tokens(&[token]);
        host.close_menu(session.player);

        if open.style == MenuStyle::Dialog {
            let text = self.interpolate(session.player, &session.quest, &*host, &choice.text);
            session.mirror_dialog(&format!("> {text}"));
        }
        debug!(player = %session.player, quest = %session.quest, node = %open.node, index, "Menu choice");

        let Some(node_ref) = choice.node else {
            self.run_branch(session, open.branch, Entry::Finish(choice.goto), host);
            return Ok(());
        };

        // Choice by reference: run the referenced node, then go where the
        // choice says instead of where that node says.
        match self.apply_target(session, &open.branch, &node_ref) {
            Resolution::Moved(to) => {
                if let Some(goto) = choice.goto {
                    session.choice_overrides.insert(to.branch.clone(), goto);
                }
                self.run_branch(session, to.branch, Entry::Execute, host);
            }
            Resolution::End(outcome) => self.end_quest(session, &outcome, host),
            Resolution::Park => {}
        }
        Ok(())
    }
}

fn menu_spec<'a>(session: &'a Session, open: &OpenMenu) -> Option<&'a MenuSpec> {
    match &session.definition.node(&NodeRef::new(open.branch.as_str(), open.node.as_str()))?.kind {
        NodeKind::DialogMenu(spec) | NodeKind::GuiMenu(spec) => Some(spec),
        _ => None,
    }
}
