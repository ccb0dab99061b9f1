//! Instruction lists: ordered verbs with delay accumulation and blocking
//! prompts, plus detached execution for rewards and stop hooks.

use tracing::{debug, warn};

use crate::definition::{Instruction, PromptMode};
use crate::error::{QuestError, Result};
use crate::host::{EffectRequest, Host};
use crate::primitives;
use crate::scheduler::TaskAction;
use crate::types::{NodeRef, PlayerId, QuestId};

use super::QuestEngine;
use super::run::{Entry, Flow};
use super::session::{Pending, Session};

impl QuestEngine {
    /// Run `list` from `start`. `wait` instructions accumulate; the first
    /// instruction after a non-zero accumulation is deferred by a resume
    /// task, so everything before it runs now and everything after it runs
    /// once the delay elapses. Blocking prompts and navigation suspend the
    /// branch until their token comes back.
    pub(crate) fn run_instructions(
        &mut self,
        session: &mut Session,
        at: &NodeRef,
        list: &[Instruction],
        start: usize,
        host: &mut dyn Host,
    ) -> Flow {
        let mut delay: u64 = 0;
        for (index, instruction) in list.iter().enumerate().skip(start) {
            if delay > 0 {
                return self.defer(session, at, index, delay);
            }
            match instruction {
                Instruction::Wait { ticks } => delay += ticks,
                Instruction::Prompt { text, mode } => {
                    let text = self.interpolate(session.player, &session.quest, &*host, text);
                    let token = self.issue_token(session.player, &session.quest);
                    session.pending.insert(
                        token,
                        Pending::Prompt {
                            branch: at.branch.clone(),
                            node: at.node.clone(),
                            resume: index + 1,
                            mode: *mode,
                        },
                    );
                    self.with_cursor(session, &at.branch, |c| c.resume_at = Some(index));
                    match mode {
                        PromptMode::Click => host.send_prompt(session.player, &text, token),
                        PromptMode::Sneak => primitives::send_message(host, session.player, &text),
                    }
                    return Flow::Suspend;
                }
                Instruction::Navigate {
                    destination,
                    wait: true,
                } => {
                    let token = self.issue_token(session.player, &session.quest);
                    let started = self
                        .caps
                        .navigator
                        .as_mut()
                        .is_some_and(|nav| nav.navigate(session.player, destination, token));
                    if started {
                        session.pending.insert(
                            token,
                            Pending::Navigation {
                                branch: at.branch.clone(),
                                node: at.node.clone(),
                                resume: index + 1,
                            },
                        );
                        self.with_cursor(session, &at.branch, |c| c.resume_at = Some(index));
                        return Flow::Suspend;
                    }
                    self.release_tokens(&[token]);
                    debug!(player = %session.player, quest = %session.quest, "Navigation unavailable; continuing");
                }
                Instruction::StartBranch { branch } => self.start_branch(session, branch),
                Instruction::StopBranch => {
                    self.stop_branch(session, &at.branch, host);
                    return Flow::Halt;
                }
                Instruction::StopQuest { quest: None } => return Flow::Stop,
                Instruction::StopQuest { quest: Some(q) } if *q == session.quest => return Flow::Stop,
                other => self.apply_instruction(session.player, &session.quest, other, host),
            }
        }
        if delay > 0 {
            return self.defer(session, at, list.len(), delay);
        }
        Flow::Next(None)
    }

    fn defer(&mut self, session: &Session, at: &NodeRef, index: usize, delay: u64) -> Flow {
        self.with_cursor(session, &at.branch, |c| {
            c.resume_at = Some(index);
            c.wait = Some(delay);
        });
        self.schedule(
            session.player,
            &session.quest,
            &at.branch,
            delay,
            TaskAction::Resume {
                node: at.node.clone(),
                index,
            },
        );
        Flow::Suspend
    }

    /// Run hooks outside a branch. Waits, prompts and branch control have
    /// nothing to suspend and are skipped.
    pub(crate) fn run_detached(&mut self, player: PlayerId, quest: &QuestId, list: &[Instruction], host: &mut dyn Host) {
        for instruction in list {
            match instruction {
                Instruction::Wait { .. }
                | Instruction::Prompt { .. }
                | Instruction::StartBranch { .. }
                | Instruction::StopBranch
                | Instruction::StopQuest { quest: None } => {
                    debug!(%player, %quest, "Flow instruction skipped in hook");
                }
                Instruction::StartQuest { quest: q } | Instruction::StopQuest { quest: Some(q) } if q == quest => {
                    debug!(%player, %quest, "Hook cannot restart or stop its own quest");
                }
                other => self.apply_instruction(player, quest, other, host),
            }
        }
    }

    /// Perform one non-flow instruction.
    fn apply_instruction(&mut self, player: PlayerId, quest: &QuestId, instruction: &Instruction, host: &mut dyn Host) {
        match instruction {
            Instruction::Message { text } => {
                let text = self.interpolate(player, quest, &*host, text);
                primitives::send_message(host, player, &text);
            }
            Instruction::ActionBar { text } => {
                let text = self.interpolate(player, quest, &*host, text);
                host.send_action_bar(player, &text);
            }
            Instruction::Sound { sound, volume, pitch } => host.play_sound(player, sound, *volume, *pitch),
            Instruction::Title {
                title,
                subtitle,
                fade_in,
                stay,
                fade_out,
            } => {
                let title = self.interpolate(player, quest, &*host, title);
                let subtitle = self.interpolate(player, quest, &*host, subtitle);
                primitives::show_title(host, player, &title, &subtitle, (*fade_in, *stay, *fade_out));
            }
            Instruction::GiveItem(stack) => {
                primitives::give_item(host, player, stack);
            }
            Instruction::TakeItem(stack) => {
                if !primitives::take_item(host, player, stack) {
                    debug!(%player, %quest, item = %stack.item, "Player lacks items to take");
                }
            }
            Instruction::ModifyItem { item, rename, lore } => {
                let rename = rename.as_deref().map(|r| self.interpolate(player, quest, &*host, r));
                let lore: Vec<String> = lore
                    .iter()
                    .map(|l| self.interpolate(player, quest, &*host, l))
                    .collect();
                host.modify_item(player, item, rename.as_deref(), &lore);
            }
            Instruction::Command { command, sender } => {
                let command = self.interpolate(player, quest, &*host, command);
                primitives::dispatch_command(host, player, &command, *sender);
            }
            Instruction::Teleport { location } => primitives::teleport(host, player, location),
            Instruction::Effect { effect, mode, at } => {
                let request = EffectRequest {
                    player,
                    quest: quest.clone(),
                    effect: effect.clone(),
                    mode: *mode,
                    anchor: at.clone(),
                };
                match self.caps.effects.as_mut() {
                    Some(fx) => {
                        if !fx.start(request) {
                            debug!(%player, %quest, %effect, "Effect refused");
                        }
                    }
                    None => debug!(%player, %effect, "No effect runner; effect skipped"),
                }
            }
            Instruction::Navigate { destination, .. } => match self.caps.navigator.as_mut() {
                Some(nav) => {
                    nav.navigate(player, destination, 0);
                }
                None => debug!(%player, "No navigator; navigation skipped"),
            },
            Instruction::StartQuest { quest: other } => {
                if let Err(e) = self.start_quest(player, other, host) {
                    debug!(%player, quest = %other, error = %e, "Chained quest did not start");
                }
            }
            Instruction::StopQuest { quest: Some(other) } => {
                if let Err(e) = self.stop_quest(player, other, host) {
                    debug!(%player, quest = %other, error = %e, "Chained quest did not stop");
                }
            }
            Instruction::Variable(change) => {
                let (current, operand, text) = {
                    let scope = self.scope(player, Some(quest), &*host);
                    (
                        scope.variable(change.scope, &change.name),
                        scope.number_or_zero(&change.value),
                        scope.interpolate(&change.value),
                    )
                };
                let value = primitives::modify_value(current.as_deref(), change.op, operand, &text);
                if let Err(e) = self.write_variable(player, Some(quest), change.scope, &change.name, value) {
                    warn!(%player, %quest, variable = %change.name, error = %e, "Variable write failed");
                }
            }
            Instruction::PoolToken { pool, amount } => {
                let now = self.now();
                let window = self.config.pools.window_secs;
                if let Err(e) = self
                    .cache
                    .modify(player, now, |state| state.grant_tokens(pool, *amount, now, window))
                {
                    warn!(%player, %pool, error = %e, "Pool grant failed");
                }
            }
            Instruction::Money { amount } => match self.caps.economy.as_mut() {
                Some(economy) => {
                    if !economy.deposit(player, *amount) {
                        warn!(%player, amount, "Economy rejected transaction");
                    }
                }
                None => debug!(%player, amount, "No economy; money skipped"),
            },
            Instruction::Unknown => warn!(%player, %quest, "Unknown instruction; skipped"),
            Instruction::Wait { .. }
            | Instruction::Prompt { .. }
            | Instruction::StartBranch { .. }
            | Instruction::StopBranch
            | Instruction::StopQuest { quest: None } => {}
        }
    }

    /// Start a parallel branch at its start node on the next tick.
    fn start_branch(&mut self, session: &Session, branch: &str) {
        let Some(start) = session.definition.branch_start(branch) else {
            warn!(quest = %session.quest, %branch, "Cannot start missing branch");
            return;
        };
        let exists = self
            .progress(session.player, &session.quest)
            .is_some_and(|p| p.cursors.contains_key(branch));
        if exists {
            debug!(quest = %session.quest, %branch, "Branch already running");
            return;
        }
        self.with_progress(session, |p| {
            p.cursors
                .insert(start.branch.clone(), crate::state::Cursor::at(&start.node));
        });
        self.schedule(session.player, &session.quest, branch, 0, TaskAction::Run);
    }

    /// Stop a branch: cursor, tasks and continuations.
    fn stop_branch(&mut self, session: &mut Session, branch: &str, host: &mut dyn Host) {
        self.clear_waits(session, branch, host);
        self.with_progress(session, |p| {
            p.cursors.remove(branch);
            let prefix = format!("{branch}:");
            p.groups.retain(|k, _| !k.starts_with(&prefix));
        });
        debug!(quest = %session.quest, %branch, "Branch stopped");
    }

    /// Continue after a prompt confirmation or navigation arrival.
    pub(crate) fn resume_token(
        &mut self,
        session: &mut Session,
        token: u64,
        navigation: bool,
        host: &mut dyn Host,
    ) -> Result<()> {
        let (branch, node, resume) = match session.pending.get(&token) {
            Some(Pending::Prompt { branch, node, resume, .. }) if !navigation => {
                (branch.clone(), node.clone(), *resume)
            }
            Some(Pending::Navigation { branch, node, resume }) if navigation => {
                (branch.clone(), node.clone(), *resume)
            }
            _ => return Err(QuestError::UnknownToken(token)),
        };
        session.pending.remove(&token);
        self.release_tokens(&[token]);

        let positioned = self.with_cursor(session, &branch, |c| {
            if c.node == node {
                c.resume_at = Some(resume);
                true
            } else {
                false
            }
        });
        if positioned == Some(true) {
            self.run_branch(session, branch, Entry::Execute, host);
        }
        Ok(())
    }

    /// Resume every sneak prompt of a session. Returns how many resumed.
    pub(crate) fn resume_sneak_prompts(&mut self, session: &mut Session, host: &mut dyn Host) -> usize {
        let mut tokens: Vec<u64> = session
            .pending
            .iter()
            .filter(|(_, p)| {
                matches!(
                    p,
                    Pending::Prompt {
                        mode: PromptMode::Sneak,
                        ..
                    }
                )
            })
            .map(|(t, _)| *t)
            .collect();
        tokens.sort_unstable();
        let mut resumed = 0;
        for token in tokens {
            if session.ended {
                break;
            }
            if self.resume_token(session, token, false, host).is_ok() {
                resumed += 1;
            }
        }
        resumed
    }
}
