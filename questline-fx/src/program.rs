//! Effect sources and their compilation to flat instruction lists.
//!
//! Two source forms exist:
//!
//! - **Flat**: a declarative ring of particles ([`FlatEffect`]), compiled to
//!   a single bounded loop.
//! - **Script**: a line-oriented program of call-style statements:
//!
//! ```text
//! # comment
//! set(r, 1.5)
//! loop(i, 0, 7, 1)
//!     display(FLAME, baseX + r * cos(i), baseY, baseZ + r * sin(i), 3)
//!     wait(2)
//! end
//! ```
//!
//! Statements may share a line. `loop(var, start, end[, step])` is
//! inclusive of `end` and its body runs until the matching `end`; loops
//! still open at the end of the script close there. Every numeric
//! argument is a formula compiled once to reverse-Polish form, with
//! `baseX`/`baseY`/`baseZ` bound to the run's anchor each tick.

use std::f64::consts::TAU;

use serde::{Deserialize, Serialize};

use questline_core::expr::Expr;

use crate::error::{FxError, Result};

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// Declarative ring effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatEffect {
    /// Particle name passed to the host.
    pub particle: String,
    /// Points around the ring.
    #[serde(default = "default_one")]
    pub points: u32,
    /// Ring radius in blocks.
    #[serde(default)]
    pub radius: f64,
    /// Vertical offset from the anchor.
    #[serde(default)]
    pub height: f64,
    /// Particles per point.
    #[serde(default = "default_one")]
    pub count: u32,
    /// Ticks between points.
    #[serde(default)]
    pub interval: u64,
}

fn default_one() -> u32 {
    1
}

/// Where an effect program comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectSource {
    /// Declarative form.
    Flat(FlatEffect),
    /// Line-oriented script text.
    Script(String),
}

// ---------------------------------------------------------------------------
// Compiled form
// ---------------------------------------------------------------------------

/// One compiled instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    /// Assign a variable.
    Set {
        /// Variable name.
        var: String,
        /// Value formula.
        value: Expr,
    },
    /// Yield for a number of ticks.
    Wait {
        /// Tick count formula.
        ticks: Expr,
    },
    /// Show a particle at absolute coordinates.
    Display {
        /// Particle name.
        particle: String,
        /// X formula.
        x: Expr,
        /// Y formula.
        y: Expr,
        /// Z formula.
        z: Expr,
        /// Particle count formula.
        count: Expr,
    },
    /// Enter a loop; jumps to `exit` when the range is empty.
    LoopHead {
        /// Loop variable.
        var: String,
        /// First value.
        start: Expr,
        /// Last value (inclusive).
        end: Expr,
        /// Increment.
        step: Expr,
        /// Index just past the matching tail.
        exit: usize,
    },
    /// Advance the innermost loop; jumps back past `head` while in range.
    LoopTail {
        /// Index of the matching head.
        head: usize,
    },
}

/// A compiled effect program.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Program {
    instrs: Vec<Instr>,
}

impl Program {
    /// Compile either source form.
    ///
    /// # Errors
    /// Returns [`FxError::Parse`] for malformed scripts.
    pub fn compile(source: &EffectSource) -> Result<Self> {
        match source {
            EffectSource::Flat(flat) => Ok(Self::flat(flat)),
            EffectSource::Script(text) => Self::parse(text),
        }
    }

    /// Compile a flat ring into one loop.
    #[must_use]
    pub fn flat(effect: &FlatEffect) -> Self {
        let points = effect.points.max(1);
        let angle = TAU / f64::from(points);
        let radius = effect.radius;
        let ring = |axis: &str, func: &str| {
            Expr::compile(&format!("{axis} + ({radius}) * {func}(i * {angle})")).unwrap_or_else(|_| Expr::constant(0.0))
        };

        let mut instrs = vec![
            Instr::LoopHead {
                var: "i".to_string(),
                start: Expr::constant(0.0),
                end: Expr::constant(f64::from(points - 1)),
                step: Expr::constant(1.0),
                exit: 0,
            },
            Instr::Display {
                particle: effect.particle.clone(),
                x: ring("baseX", "cos"),
                y: Expr::compile(&format!("baseY + ({})", effect.height)).unwrap_or_else(|_| Expr::constant(0.0)),
                z: ring("baseZ", "sin"),
                count: Expr::constant(f64::from(effect.count)),
            },
        ];
        if effect.interval > 0 {
            #[allow(clippy::cast_precision_loss)]
            instrs.push(Instr::Wait {
                ticks: Expr::constant(effect.interval as f64),
            });
        }
        instrs.push(Instr::LoopTail { head: 0 });
        let exit = instrs.len();
        if let Some(Instr::LoopHead { exit: e, .. }) = instrs.first_mut() {
            *e = exit;
        }
        Self { instrs }
    }

    /// Parse a line-form script.
    ///
    /// # Errors
    /// Returns [`FxError::Parse`] naming the offending line.
    pub fn parse(text: &str) -> Result<Self> {
        let mut instrs = Vec::new();
        let mut open: Vec<usize> = Vec::new();

        for (index, raw) in text.lines().enumerate() {
            let line = index + 1;
            let code = raw.split('#').next().unwrap_or("");
            for statement in statements(code, line)? {
                compile_statement(&statement, line, &mut instrs, &mut open)?;
            }
        }
        while let Some(head) = open.pop() {
            close_loop(&mut instrs, head);
        }
        Ok(Self { instrs })
    }

    /// The compiled instructions.
    #[must_use]
    pub fn instrs(&self) -> &[Instr] {
        &self.instrs
    }

    /// Number of instructions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    /// True for a program with nothing to run.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

struct Statement<'a> {
    name: &'a str,
    args: Vec<&'a str>,
}

/// Split one line into `name(args)` / bare `name` statements.
fn statements(code: &str, line: usize) -> Result<Vec<Statement<'_>>> {
    let mut out = Vec::new();
    let mut rest = code;
    loop {
        rest = rest.trim_start_matches(|c: char| c.is_whitespace() || c == ';');
        if rest.is_empty() {
            return Ok(out);
        }
        let name_len = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(rest.len());
        if name_len == 0 {
            let c = rest.chars().next().unwrap_or(' ');
            return Err(FxError::parse(line, format!("unexpected '{c}'")));
        }
        let name = &rest[..name_len];
        rest = rest[name_len..].trim_start();

        if !rest.starts_with('(') {
            out.push(Statement { name, args: Vec::new() });
            continue;
        }
        let mut depth = 0usize;
        let mut close = None;
        for (i, c) in rest.char_indices() {
            match c {
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth == 0 {
                        close = Some(i);
                        break;
                    }
                }
                _ => {}
            }
        }
        let close = close.ok_or_else(|| FxError::parse(line, format!("unclosed '(' after {name}")))?;
        out.push(Statement {
            name,
            args: split_args(&rest[1..close]),
        });
        rest = &rest[close + 1..];
    }
}

/// Split on commas outside parentheses.
fn split_args(inner: &str) -> Vec<&str> {
    if inner.trim().is_empty() {
        return Vec::new();
    }
    let mut args = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in inner.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => {
                args.push(inner[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    args.push(inner[start..].trim());
    args
}

fn compile_statement(st: &Statement<'_>, line: usize, instrs: &mut Vec<Instr>, open: &mut Vec<usize>) -> Result<()> {
    let expr = |src: &str| Expr::compile(src).map_err(|e| FxError::parse(line, format!("{src}: {e}")));
    let arity = |allowed: &[usize]| {
        if allowed.contains(&st.args.len()) {
            Ok(())
        } else {
            Err(FxError::parse(
                line,
                format!("{} takes {allowed:?} arguments, got {}", st.name, st.args.len()),
            ))
        }
    };

    match st.name.to_ascii_lowercase().as_str() {
        "set" => {
            arity(&[2])?;
            instrs.push(Instr::Set {
                var: identifier(st.args[0], line)?,
                value: expr(st.args[1])?,
            });
        }
        "wait" => {
            arity(&[1])?;
            instrs.push(Instr::Wait {
                ticks: expr(st.args[0])?,
            });
        }
        "display" => {
            arity(&[4, 5])?;
            instrs.push(Instr::Display {
                particle: st.args[0].to_string(),
                x: expr(st.args[1])?,
                y: expr(st.args[2])?,
                z: expr(st.args[3])?,
                count: match st.args.get(4) {
                    Some(count) => expr(count)?,
                    None => Expr::constant(1.0),
                },
            });
        }
        "loop" => {
            arity(&[3, 4])?;
            open.push(instrs.len());
            instrs.push(Instr::LoopHead {
                var: identifier(st.args[0], line)?,
                start: expr(st.args[1])?,
                end: expr(st.args[2])?,
                step: match st.args.get(3) {
                    Some(step) => expr(step)?,
                    None => Expr::constant(1.0),
                },
                exit: 0,
            });
        }
        "end" => {
            arity(&[0])?;
            let head = open.pop().ok_or_else(|| FxError::parse(line, "'end' without a loop"))?;
            close_loop(instrs, head);
        }
        other => return Err(FxError::parse(line, format!("unknown statement '{other}'"))),
    }
    Ok(())
}

fn identifier(arg: &str, line: usize) -> Result<String> {
    let valid = arg.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && arg.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(arg.to_string())
    } else {
        Err(FxError::parse(line, format!("'{arg}' is not a variable name")))
    }
}

fn close_loop(instrs: &mut Vec<Instr>, head: usize) {
    instrs.push(Instr::LoopTail { head });
    let exit = instrs.len();
    if let Some(Instr::LoopHead { exit: e, .. }) = instrs.get_mut(head) {
        *e = exit;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_line_loop_closes_at_end_of_script() {
        let program =
            Program::parse("loop(i,0,3,1) display(FLAME, baseX+i, baseY, baseZ, 5)").expect("parse");
        assert_eq!(program.len(), 3);
        assert!(matches!(program.instrs()[0], Instr::LoopHead { exit: 3, .. }));
        assert!(matches!(program.instrs()[2], Instr::LoopTail { head: 0 }));
    }

    #[test]
    fn nested_loops_patch_their_exits() {
        let program = Program::parse(
            "loop(a, 1, 2)\n  loop(b, 1, 2) # inner\n    display(DUST, a, b, 0)\n  end\n  wait(1)\nend\n",
        )
        .expect("parse");
        let kinds: Vec<&Instr> = program.instrs().iter().collect();
        assert!(matches!(kinds[0], Instr::LoopHead { exit: 6, .. }));
        assert!(matches!(kinds[1], Instr::LoopHead { exit: 4, .. }));
        assert!(matches!(kinds[3], Instr::LoopTail { head: 1 }));
        assert!(matches!(kinds[5], Instr::LoopTail { head: 0 }));
    }

    #[test]
    fn parse_errors_name_the_line() {
        let err = Program::parse("set(x, 1)\nend").expect_err("stray end");
        assert_eq!(err, FxError::parse(2, "'end' without a loop"));

        assert!(matches!(Program::parse("explode()"), Err(FxError::Parse { line: 1, .. })));
        assert!(matches!(Program::parse("display(A, 1)"), Err(FxError::Parse { line: 1, .. })));
        assert!(matches!(Program::parse("set(2x, 1)"), Err(FxError::Parse { .. })));
        assert!(matches!(Program::parse("wait(1 +)"), Err(FxError::Parse { .. })));
        assert!(matches!(Program::parse("wait(1"), Err(FxError::Parse { .. })));
    }

    #[test]
    fn flat_ring_is_a_single_loop() {
        let program = Program::flat(&FlatEffect {
            particle: "HEART".into(),
            points: 8,
            radius: 2.0,
            height: 1.0,
            count: 1,
            interval: 2,
        });
        assert_eq!(program.len(), 4);
        assert!(matches!(program.instrs()[0], Instr::LoopHead { exit: 4, .. }));
        assert!(matches!(program.instrs()[2], Instr::Wait { .. }));
    }

    #[test]
    fn sources_read_from_toml() {
        #[derive(Deserialize)]
        struct Doc {
            ring: EffectSource,
            spiral: EffectSource,
        }
        let doc: Doc = toml::from_str(
            r#"
            ring = { flat = { particle = "FLAME", points = 4, radius = 1.0 } }
            spiral = { script = "loop(i, 0, 9) display(END_ROD, baseX, baseY + i / 4, baseZ) end" }
            "#,
        )
        .expect("toml");
        assert!(matches!(doc.ring, EffectSource::Flat(FlatEffect { points: 4, .. })));
        assert!(Program::compile(&doc.spiral).is_ok());
    }
}
