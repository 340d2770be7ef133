//! Mission script parser.
//!
//! Lines before `BeginMissionSequence` declare objects and solvers and set
//! initial values; lines after it are mission commands. Control sequences are
//! assembled by appending every command to the outermost open sequence, whose
//! branch forwards it to the innermost open level.

use std::collections::BTreeMap;

use tracing::{debug, instrument};

use crate::bridge::EngineFactory;
use crate::command::{
    Achieve, Assign, Command, Minimize, NonlinearConstraint, Relation, Report, Vary,
};
use crate::core::error::ControlError;
use crate::core::expr::Expr;
use crate::core::objects::{ObjectKind, ObjectStore};
use crate::core::types::SequenceKind;
use crate::sequence::ControlSequence;
use crate::solver::{SolverConfig, SolverDefaults};

/// Settings the parser needs beyond the script text.
#[derive(Clone, Copy)]
pub struct BuildOptions<'a> {
    pub defaults: &'a SolverDefaults,
    pub report_progress: bool,
    /// Engine source for `ExternalOptimizer` sequences. Without one, such a
    /// sequence fails with `EngineUnavailable` when it reaches `RunExternal`.
    pub engines: Option<&'a dyn EngineFactory>,
}

/// A parsed script: objects with their initial values, solver templates and
/// the top-level mission commands.
#[derive(Debug, Default)]
pub struct Mission {
    pub objects: ObjectStore,
    pub solvers: BTreeMap<String, SolverConfig>,
    pub commands: Vec<Command>,
}

impl Mission {
    /// Top-level control sequences, in mission order.
    pub fn sequences(&self) -> impl Iterator<Item = &ControlSequence> {
        self.commands.iter().filter_map(|command| match command {
            Command::Sequence(sequence) => Some(sequence.as_ref()),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Objects,
    Mission,
}

struct Builder<'a> {
    options: BuildOptions<'a>,
    mission: Mission,
    section: Section,
    open: Option<ControlSequence>,
    line: usize,
}

#[instrument(skip_all)]
pub fn parse_script(text: &str, options: BuildOptions<'_>) -> Result<Mission, ControlError> {
    let mut builder = Builder {
        options,
        mission: Mission::default(),
        section: Section::Objects,
        open: None,
        line: 0,
    };
    for (index, raw) in text.lines().enumerate() {
        builder.line = index + 1;
        let line = strip_line(raw);
        if line.is_empty() {
            continue;
        }
        builder.statement(line)?;
    }
    if let Some(open) = builder.open {
        return Err(ControlError::BranchNotClosed { kind: open.kind() });
    }
    debug!(
        objects = builder.mission.objects.values().len(),
        solvers = builder.mission.solvers.len(),
        commands = builder.mission.commands.len(),
        "script parsed"
    );
    Ok(builder.mission)
}

/// Drop the comment and the optional trailing `;`.
fn strip_line(raw: &str) -> &str {
    let line = raw.split_once('%').map_or(raw, |(code, _)| code).trim();
    line.strip_suffix(';').unwrap_or(line).trim_end()
}

impl Builder<'_> {
    fn error(&self, reason: impl Into<String>) -> ControlError {
        ControlError::Script {
            line: self.line,
            reason: reason.into(),
        }
    }

    fn statement(&mut self, line: &str) -> Result<(), ControlError> {
        let (keyword, rest) = split_keyword(line);
        match (self.section, keyword) {
            (Section::Objects, "Create") => self.create(rest),
            (Section::Objects, "BeginMissionSequence") => {
                self.section = Section::Mission;
                Ok(())
            }
            (Section::Objects, _) => self.initial_value(line),
            (Section::Mission, "Create") => {
                Err(self.error("Create is only allowed before BeginMissionSequence"))
            }
            (Section::Mission, "BeginMissionSequence") => {
                Err(self.error("BeginMissionSequence appears twice"))
            }
            (Section::Mission, "Target") => self.open_sequence(SequenceKind::Target, rest),
            (Section::Mission, "Optimize") => self.open_sequence(SequenceKind::Optimize, rest),
            (Section::Mission, "EndTarget") => self.close_sequence(SequenceKind::Target),
            (Section::Mission, "EndOptimize") => self.close_sequence(SequenceKind::Optimize),
            (Section::Mission, "Report") => {
                let names: Vec<String> = rest.split_whitespace().map(str::to_string).collect();
                if names.is_empty() {
                    return Err(self.error("Report needs at least one name"));
                }
                for name in &names {
                    if !self.mission.objects.contains(name) {
                        return Err(self.error(format!("unknown object '{name}'")));
                    }
                }
                self.push(Command::Report(Report { names }))
            }
            (Section::Mission, "Vary") => {
                let vary = self.vary(rest)?;
                self.push_worker(Command::Vary(vary))
            }
            (Section::Mission, "Achieve") => {
                let achieve = self.achieve(rest)?;
                self.push_worker(Command::Achieve(achieve))
            }
            (Section::Mission, "Minimize") => {
                let (solver, body, options) = self.call(rest)?;
                self.reject_options("Minimize", &options, &[])?;
                let minimize = Minimize {
                    solver,
                    expr: self.expr(body)?,
                    handle: None,
                };
                self.push_worker(Command::Minimize(minimize))
            }
            (Section::Mission, "NonlinearConstraint") => {
                let constraint = self.constraint(rest)?;
                self.push_worker(Command::NonlinearConstraint(constraint))
            }
            (Section::Mission, _) => {
                let assign = self.assignment(line)?;
                self.push(Command::Assign(assign))
            }
        }
    }

    fn create(&mut self, rest: &str) -> Result<(), ControlError> {
        let mut words = rest.split_whitespace();
        let (Some(type_name), Some(name), None) = (words.next(), words.next(), words.next()) else {
            return Err(self.error("expected 'Create <Type> <name>'"));
        };
        if !is_identifier(name) {
            return Err(self.error(format!("'{name}' is not a valid name")));
        }
        if self.mission.solvers.contains_key(name) || self.mission.objects.kind(name).is_some() {
            return Err(self.error(format!("'{name}' is already defined")));
        }
        match type_name {
            "Variable" => {
                self.mission.objects.declare(name, ObjectKind::Variable);
            }
            "Spacecraft" => {
                self.mission.objects.declare(name, ObjectKind::Spacecraft);
            }
            _ => {
                let config = SolverConfig::from_type(type_name, self.options.defaults)
                    .ok_or_else(|| self.error(format!("unknown type '{type_name}'")))?;
                self.mission.solvers.insert(name.to_string(), config);
            }
        }
        Ok(())
    }

    /// `v = 5`, `Sat.X = 7000` or `DC1.MaximumIterations = 25`.
    fn initial_value(&mut self, line: &str) -> Result<(), ControlError> {
        let (target, value) = line
            .split_once('=')
            .map(|(target, value)| (target.trim(), value.trim()))
            .ok_or_else(|| self.error(format!("unrecognized statement '{line}'")))?;
        if let Some((owner, field)) = target.split_once('.')
            && let Some(config) = self.mission.solvers.get_mut(owner)
        {
            let line = self.line;
            return config
                .set_field(field, value)
                .map_err(|reason| ControlError::Script { line, reason });
        }
        let value = self.expr(value)?.eval(&self.mission.objects)?;
        self.mission
            .objects
            .set(target, value)
            .map_err(|_| self.error(format!("unknown object '{target}'")))
    }

    fn assignment(&self, line: &str) -> Result<Assign, ControlError> {
        let (target, expr) = line
            .split_once('=')
            .map(|(target, expr)| (target.trim(), expr.trim()))
            .ok_or_else(|| self.error(format!("unrecognized command '{line}'")))?;
        self.check_settable(target)?;
        Ok(Assign {
            target: target.to_string(),
            expr: self.expr(expr)?,
        })
    }

    fn check_settable(&self, target: &str) -> Result<(), ControlError> {
        let owner = target.split_once('.').map_or(target, |(owner, _)| owner);
        let settable = match self.mission.objects.kind(owner) {
            Some(ObjectKind::Variable) => !target.contains('.'),
            Some(ObjectKind::Spacecraft) => target.contains('.'),
            None => false,
        };
        if settable {
            Ok(())
        } else {
            Err(self.error(format!("'{target}' cannot be assigned")))
        }
    }

    fn open_sequence(&mut self, kind: SequenceKind, rest: &str) -> Result<(), ControlError> {
        let name = rest.trim();
        if name.is_empty() {
            return Err(self.error(format!("{kind} needs a solver name")));
        }
        let config = self
            .mission
            .solvers
            .get(name)
            .ok_or_else(|| ControlError::MissingSolver {
                name: name.to_string(),
            })?;
        if !config.supports(kind) {
            return Err(ControlError::WrongSolverType {
                name: name.to_string(),
                kind,
                expected: match kind {
                    SequenceKind::Target => "DifferentialCorrector",
                    SequenceKind::Optimize => "Optimizer or ExternalOptimizer",
                },
                actual: config.type_name(),
            });
        }
        let mut sequence = ControlSequence::new(kind, config.build(name))
            .with_progress(self.options.report_progress);
        if let (SolverConfig::External(settings), Some(engines)) = (config, self.options.engines) {
            sequence = sequence.with_engine(engines.create(name, settings)?);
        }
        debug!(line = self.line, %kind, solver = name, "sequence opened");
        match self.open.as_mut() {
            Some(outer) => outer.append(Command::Sequence(Box::new(sequence))),
            None => {
                self.open = Some(sequence);
                Ok(())
            }
        }
    }

    fn close_sequence(&mut self, kind: SequenceKind) -> Result<(), ControlError> {
        let Some(outer) = self.open.as_mut() else {
            return Err(self.error(format!(
                "{} without a matching {}",
                kind.close_keyword(),
                kind.open_keyword()
            )));
        };
        outer.append(Command::End(kind))?;
        if outer.branch().is_closed() {
            if let Some(done) = self.open.take() {
                self.mission.commands.push(Command::Sequence(Box::new(done)));
            }
        }
        Ok(())
    }

    fn push(&mut self, command: Command) -> Result<(), ControlError> {
        match self.open.as_mut() {
            Some(outer) => outer.append(command),
            None => {
                self.mission.commands.push(command);
                Ok(())
            }
        }
    }

    fn push_worker(&mut self, command: Command) -> Result<(), ControlError> {
        if self.open.is_none() {
            return Err(self.error(format!(
                "{} must appear inside a Target or Optimize sequence",
                command.keyword()
            )));
        }
        self.push(command)
    }

    fn expr(&self, source: &str) -> Result<Expr, ControlError> {
        Expr::parse(source).map_err(|err| self.error(err.to_string()))
    }

    /// Split `Solver(body, {Key = value, ...})`.
    fn call<'l>(
        &self,
        rest: &'l str,
    ) -> Result<(String, &'l str, Vec<(&'l str, &'l str)>), ControlError> {
        let (solver, args) = rest
            .split_once('(')
            .map(|(solver, args)| (solver.trim(), args))
            .ok_or_else(|| self.error("expected 'Solver(...)'"))?;
        let args = args
            .trim_end()
            .strip_suffix(')')
            .ok_or_else(|| self.error("missing closing ')'"))?;
        if !is_identifier(solver) {
            return Err(self.error(format!("'{solver}' is not a valid solver name")));
        }
        let (body, options) = match args.split_once('{') {
            Some((body, options)) => {
                let options = options
                    .trim_end()
                    .strip_suffix('}')
                    .ok_or_else(|| self.error("missing closing '}'"))?;
                let body = body.trim_end();
                let body = body
                    .strip_suffix(',')
                    .ok_or_else(|| self.error("expected ',' before '{'"))?;
                (body, self.options_list(options)?)
            }
            None => (args, Vec::new()),
        };
        Ok((solver.to_string(), body.trim(), options))
    }

    fn options_list<'l>(&self, options: &'l str) -> Result<Vec<(&'l str, &'l str)>, ControlError> {
        options
            .split(',')
            .filter(|item| !item.trim().is_empty())
            .map(|item| {
                item.split_once('=')
                    .map(|(key, value)| (key.trim(), value.trim()))
                    .ok_or_else(|| {
                        self.error(format!("expected 'Key = value', got '{}'", item.trim()))
                    })
            })
            .collect()
    }

    fn reject_options(
        &self,
        command: &str,
        options: &[(&str, &str)],
        allowed: &[&str],
    ) -> Result<(), ControlError> {
        match options.iter().find(|(key, _)| !allowed.contains(key)) {
            Some((key, _)) => Err(self.error(format!("{command} has no option '{key}'"))),
            None => Ok(()),
        }
    }

    fn number(&self, key: &str, value: &str) -> Result<f64, ControlError> {
        self.expr(value)?
            .eval(&self.mission.objects)
            .map_err(|err| self.error(format!("{key}: {err}")))
    }

    fn vary(&self, rest: &str) -> Result<Vary, ControlError> {
        let (solver, body, options) = self.call(rest)?;
        self.reject_options(
            "Vary",
            &options,
            &["Perturbation", "Lower", "Upper", "MaxStep"],
        )?;
        let (target, initial) = match body.split_once('=') {
            Some((target, initial)) => (target.trim(), self.expr(initial)?),
            None => (body, self.expr(body)?),
        };
        self.check_settable(target)?;
        let mut vary = Vary {
            solver,
            target: target.to_string(),
            initial,
            perturbation: self.options.defaults.perturbation,
            lower: f64::NEG_INFINITY,
            upper: f64::INFINITY,
            max_step: f64::INFINITY,
            handle: None,
        };
        for (key, value) in options {
            let value = self.number(key, value)?;
            match key {
                "Perturbation" if value != 0.0 => vary.perturbation = value,
                "Perturbation" => return Err(self.error("Perturbation must be non-zero")),
                "Lower" => vary.lower = value,
                "Upper" => vary.upper = value,
                "MaxStep" if value > 0.0 => vary.max_step = value,
                "MaxStep" => return Err(self.error("MaxStep must be positive")),
                other => return Err(self.error(format!("Vary has no option '{other}'"))),
            }
        }
        if vary.lower > vary.upper {
            return Err(self.error(format!(
                "Lower {} is above Upper {}",
                vary.lower, vary.upper
            )));
        }
        Ok(vary)
    }

    fn achieve(&self, rest: &str) -> Result<Achieve, ControlError> {
        let (solver, body, options) = self.call(rest)?;
        self.reject_options("Achieve", &options, &["Tolerance"])?;
        let (expr, goal) = body
            .split_once('=')
            .ok_or_else(|| self.error("expected 'Achieve Solver(name = goal)'"))?;
        Ok(Achieve {
            solver,
            expr: self.expr(expr)?,
            goal: self.expr(goal)?,
            tolerance: self.tolerance(&options)?,
            handle: None,
        })
    }

    fn constraint(&self, rest: &str) -> Result<NonlinearConstraint, ControlError> {
        let (solver, body, options) = self.call(rest)?;
        self.reject_options("NonlinearConstraint", &options, &["Tolerance"])?;
        let (lhs, op, rhs) = split_relation(body)
            .ok_or_else(|| self.error("expected 'lhs <= rhs', 'lhs >= rhs' or 'lhs = rhs'"))?;
        Ok(NonlinearConstraint {
            solver,
            lhs: self.expr(lhs)?,
            op,
            rhs: self.expr(rhs)?,
            tolerance: self.tolerance(&options)?,
            handle: None,
        })
    }

    fn tolerance(&self, options: &[(&str, &str)]) -> Result<f64, ControlError> {
        match options.iter().find(|(key, _)| *key == "Tolerance") {
            Some((key, value)) => {
                let tolerance = self.number(key, value)?;
                if tolerance > 0.0 {
                    Ok(tolerance)
                } else {
                    Err(self.error("Tolerance must be positive"))
                }
            }
            None => Ok(self.options.defaults.tolerance),
        }
    }
}

fn split_keyword(line: &str) -> (&str, &str) {
    match line.split_once(char::is_whitespace) {
        Some((keyword, rest)) => (keyword, rest.trim()),
        None => (line, ""),
    }
}

fn split_relation(body: &str) -> Option<(&str, Relation, &str)> {
    if let Some((lhs, rhs)) = body.split_once("<=") {
        return Some((lhs, Relation::LessEqual, rhs));
    }
    if let Some((lhs, rhs)) = body.split_once(">=") {
        return Some((lhs, Relation::GreaterEqual, rhs));
    }
    body.split_once('=')
        .map(|(lhs, rhs)| (lhs, Relation::Equal, rhs))
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    const MISSION: &str = "\
Create Variable v
Create Variable c
Create Spacecraft Sat
Create DifferentialCorrector DC1
v = 5;           % initial guess
Sat.X = 7000
DC1.MaximumIterations = 30
BeginMissionSequence
Target DC1
   Vary DC1(v = 5, {Perturbation = 1e-6, Lower = 0, Upper = 10, MaxStep = 2})
   c = v - 3
   Achieve DC1(c = 0, {Tolerance = 1e-9})
EndTarget
Report v Sat.X
";

    fn parse(text: &str) -> Result<Mission, ControlError> {
        let defaults = SolverDefaults::default();
        parse_script(
            text,
            BuildOptions {
                defaults: &defaults,
                report_progress: true,
                engines: None,
            },
        )
    }

    #[test]
    fn parses_objects_solvers_and_sequences() {
        let mission = parse(MISSION).expect("parse");
        assert_eq!(mission.objects.get("v").expect("v"), 5.0);
        assert_eq!(mission.objects.get("Sat.X").expect("Sat.X"), 7000.0);
        assert_eq!(
            mission.solvers.get("DC1"),
            Some(&SolverConfig::DifferentialCorrector { max_iterations: 30 })
        );
        assert_eq!(mission.commands.len(), 2);
        let sequence = mission.sequences().next().expect("sequence");
        assert_eq!(sequence.kind(), SequenceKind::Target);
        assert!(sequence.branch().is_closed());
        let keywords: Vec<&str> = sequence
            .branch()
            .commands()
            .iter()
            .map(Command::keyword)
            .collect();
        assert_eq!(keywords, vec!["Vary", "Assign", "Achieve", "EndTarget"]);
    }

    #[test]
    fn vary_options_are_applied() {
        let mission = parse(MISSION).expect("parse");
        let sequence = mission.sequences().next().expect("sequence");
        let Command::Vary(vary) = &sequence.branch().commands()[0] else {
            panic!("expected Vary first");
        };
        assert_eq!((vary.lower, vary.upper, vary.max_step), (0.0, 10.0, 2.0));
        assert_eq!(vary.perturbation, 1e-6);
    }

    #[test]
    fn undefined_solver_is_reported() {
        let err = parse("BeginMissionSequence\nTarget Nope\nEndTarget\n").expect_err("missing");
        assert!(matches!(err, ControlError::MissingSolver { name } if name == "Nope"));
    }

    #[test]
    fn solver_type_must_fit_the_sequence() {
        let err = parse("Create Optimizer Opt\nBeginMissionSequence\nTarget Opt\n")
            .expect_err("type");
        assert!(matches!(err, ControlError::WrongSolverType { actual: "Optimizer", .. }));
    }

    #[test]
    fn unclosed_sequence_is_rejected() {
        let err = parse("Create DifferentialCorrector DC1\nBeginMissionSequence\nTarget DC1\n")
            .expect_err("unclosed");
        assert!(matches!(
            err,
            ControlError::BranchNotClosed {
                kind: SequenceKind::Target,
            }
        ));
    }

    #[test]
    fn mismatched_close_is_rejected() {
        let text = "\
Create DifferentialCorrector DC1
BeginMissionSequence
Target DC1
EndOptimize
";
        let err = parse(text).expect_err("mismatch");
        assert!(matches!(err, ControlError::MismatchedClose { .. }));
    }

    #[test]
    fn achieve_is_not_allowed_in_optimize() {
        let text = "\
Create Variable v
Create Optimizer Opt
BeginMissionSequence
Optimize Opt
   Achieve Opt(v = 1)
EndOptimize
";
        assert!(matches!(parse(text), Err(ControlError::CommandNotAllowed { .. })));
    }

    #[test]
    fn syntax_errors_carry_the_line() {
        let text = "Create Variable v\nBeginMissionSequence\nv = (1 +\n";
        assert!(matches!(parse(text), Err(ControlError::Script { line: 3, .. })));
        let text = "Create Gizmo g\n";
        assert!(matches!(parse(text), Err(ControlError::Script { line: 1, .. })));
    }

    #[test]
    fn worker_outside_a_sequence_is_rejected() {
        let text = "\
Create Variable v
Create DifferentialCorrector DC1
BeginMissionSequence
Vary DC1(v = 1)
";
        assert!(matches!(parse(text), Err(ControlError::Script { line: 4, .. })));
    }

    #[test]
    fn relations_split_on_the_two_character_operators_first() {
        assert_eq!(
            split_relation("a <= b").map(|(_, op, _)| op),
            Some(Relation::LessEqual)
        );
        assert_eq!(
            split_relation("a >= 2").map(|(_, op, _)| op),
            Some(Relation::GreaterEqual)
        );
        assert_eq!(
            split_relation("a = b").map(|(_, op, _)| op),
            Some(Relation::Equal)
        );
        assert_eq!(split_relation("a"), None);
    }
}
