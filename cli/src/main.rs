use std::process;

use clap::Parser;
use colored::Colorize;

use lockstep::{Condition, Engine, FlowError, FlowEvent, Scheduler, Value};

#[derive(Parser)]
#[command(name = "lockstep", about = "Demo driver for the lockstep scheduler")]
struct Cli {
    /// Scenario to run (serial, callbacks, parallel, wait, cancel)
    scenario: Option<String>,
    /// List available scenarios
    #[arg(long)]
    list: bool,
    /// Use wall-clock timers instead of the virtual clock
    #[arg(long)]
    realtime: bool,
    /// Capture scheduling chains in rejection reasons
    #[arg(long)]
    trace: bool,
    /// Print version and exit
    #[arg(long)]
    version: bool,
}

const SCENARIOS: &[(&str, &str)] = &[
    ("serial", "three commands run strictly in order"),
    ("callbacks", "callback work slots in before later siblings"),
    ("parallel", "a timer opens a sibling queue that interleaves"),
    ("wait", "poll a condition until it turns truthy"),
    ("cancel", "a cancelled command never runs"),
];

fn main() {
    let cli = Cli::parse();

    if cli.version {
        println!("lockstep {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    if cli.list || cli.scenario.is_none() {
        println!("scenarios:");
        for (name, blurb) in SCENARIOS {
            println!("  {:10} {}", name.bold(), blurb);
        }
        return;
    }

    let name = cli.scenario.unwrap_or_default();
    let mut scheduler = Engine::new()
        .with_realtime_timers(cli.realtime)
        .with_long_stack_traces(cli.trace)
        .new_scheduler();

    let result = run_scenario(&mut scheduler, &name);
    for entry in scheduler.history() {
        println!("  {} {}", "ran".green(), entry);
    }
    if let Err(err) = result {
        eprintln!("{} {err}", "error:".red().bold());
        process::exit(1);
    }
}

fn run_scenario(scheduler: &mut Scheduler, name: &str) -> Result<(), FlowError> {
    let flow = scheduler.active_flow();
    match name {
        "serial" => {
            for step in ["open page", "click button", "read result"] {
                scheduler.execute(flow, step, |_| Ok(Value::Null));
            }
        }
        "callbacks" => {
            let first = scheduler.execute(flow, "first", |_| Ok(Value::str("done")));
            scheduler.then(
                &first,
                Some(Box::new(|scheduler: &mut Scheduler, value| {
                    let flow = scheduler.active_flow();
                    scheduler.execute(flow, "reaction to first", move |_| Ok(value.clone()));
                    Ok(Value::Null)
                })),
                None,
            );
            scheduler.execute(flow, "second", |_| Ok(Value::Null));
        }
        "parallel" => {
            scheduler.execute(flow, "slow command", |scheduler| {
                Ok(Value::Promise(scheduler.delayed(10)))
            });
            scheduler.execute(flow, "next command", |_| Ok(Value::Null));
            scheduler.set_timeout(0, move |scheduler| {
                scheduler.execute(flow, "sibling lane", |_| Ok(Value::Null));
            });
        }
        "wait" => {
            let mut calls = 0;
            scheduler.wait(
                flow,
                Condition::poll(move |_| {
                    calls += 1;
                    Ok(Value::Bool(calls >= 3))
                }),
                100,
                "third time lucky",
            );
            scheduler.execute(flow, "after the wait", |_| Ok(Value::Null));
        }
        "cancel" => {
            let doomed = scheduler.execute(flow, "never runs", |_| Ok(Value::Null));
            scheduler.cancel(&doomed, "changed our mind");
            scheduler.execute(flow, "still runs", |_| Ok(Value::Null));
        }
        other => {
            eprintln!("unknown scenario '{other}', try --list");
            process::exit(2);
        }
    }
    scheduler.once(flow, FlowEvent::Idle, |_, _| {
        println!("  {}", "idle".blue());
    });
    scheduler.run_until_idle()
}
