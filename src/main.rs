use aio_board::{BoardSimulator, DeviceConfig, DeviceController, SimConnector, WriteResult};
use crossterm::style::Stylize;
use parking_lot::Mutex;
use serde_json::Value;
use std::io::{self, BufRead, Write};
use std::sync::Arc;

// Entry point of the board console. An optional argument names a TOML config.
fn main() {
    aio_board::logging::init("info");

    println!("=========================");
    println!("   Analog I/O Console    ");
    println!("=========================");

    let config = match std::env::args().nth(1) {
        Some(path) => match DeviceConfig::load(&path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("{} {}", "[ERROR]".red(), e);
                return;
            }
        },
        None => DeviceConfig::default(),
    };

    // Main menu loop.
    loop {
        println!("\nSelect board:");
        println!("  1. Serial Port");
        println!("  2. Simulated Board");
        println!("  3. Exit");
        let choice = match prompt("> ") {
            Some(choice) => choice,
            None => break,
        };

        match choice.as_str() {
            "1" => {
                if let Some(config) = choose_serial_port(&config) {
                    run_session(DeviceController::serial(config));
                }
            }
            "2" => {
                let board = Arc::new(Mutex::new(BoardSimulator::new()));
                let connector = SimConnector::new(board);
                let config = DeviceConfig {
                    port: "simulated".to_string(),
                    ..config.clone()
                };
                run_session(DeviceController::new(config, Box::new(connector)));
            }
            "3" => break,
            _ => eprintln!("{} Invalid choice. Please enter 1, 2, or 3.", "[ERROR]".red()),
        }
    }
}

// Prints `label`, then reads one trimmed line. `None` on end of input.
fn prompt(label: &str) -> Option<String> {
    print!("{}", label);
    io::stdout().flush().ok()?;
    let mut line = String::new();
    match io::stdin().lock().read_line(&mut line) {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(line.trim().to_string()),
    }
}

// Lets the user pick a port and baud rate.
fn choose_serial_port(base: &DeviceConfig) -> Option<DeviceConfig> {
    let ports = match serialport::available_ports() {
        Ok(ports) => ports,
        Err(e) => {
            eprintln!("{} Could not enumerate serial ports: {}", "[ERROR]".red(), e);
            return None;
        }
    };
    if ports.is_empty() {
        eprintln!("{} No serial ports found.", "[ERROR]".red());
        return None;
    }

    println!("Available serial ports:");
    for (i, port) in ports.iter().enumerate() {
        println!("  {}: {}", i, port.port_name);
    }
    let port_index: usize = match prompt("Select a port (number): ")?.parse() {
        Ok(i) if i < ports.len() => i,
        _ => {
            eprintln!("{} Invalid port selection.", "[ERROR]".red());
            return None;
        }
    };

    let baud_rates = [9600, 19200, 38400, 57600, 115200];
    println!("Available baud rates:");
    for (i, &rate) in baud_rates.iter().enumerate() {
        println!("  {}: {}", i, rate);
    }
    let answer = prompt(&format!("Select a baud rate (number, default {}): ", base.baud_rate))?;
    let baud_rate = match answer.as_str() {
        "" => base.baud_rate,
        s => match s.parse::<usize>() {
            Ok(i) if i < baud_rates.len() => baud_rates[i],
            _ => {
                eprintln!("{} Invalid baud rate selection.", "[ERROR]".red());
                return None;
            }
        },
    };

    Some(DeviceConfig {
        port: ports[port_index].port_name.clone(),
        baud_rate,
        ..base.clone()
    })
}

// Connects, then runs the command prompt until `back` or end of input.
fn run_session(mut device: DeviceController) {
    println!("\nConnecting to {} ...", device.config().port);
    match device.connect() {
        Ok(()) => println!("{} connected", "[OK]".green()),
        Err(e) => {
            eprintln!("{} {}", "[ERROR]".red(), e);
            return;
        }
    }

    println!("Enter '<command> <params>...', 'status', 'reconnect', or 'back'.");
    println!("Commands: comtest, vset, vread, verbose, sample, sweep, switch, flip, reporting.");
    while let Some(line) = prompt("> ") {
        let (command, rest) = match line.split_once(char::is_whitespace) {
            Some((command, rest)) => (command, rest.trim()),
            None => (line.as_str(), ""),
        };
        match command {
            "" => continue,
            "back" => break,
            "status" => println!(
                "{} | switch {}",
                device.connection_state(),
                device.switch_state()
            ),
            "reconnect" => match device.reconnect() {
                Ok(()) => println!("{} reconnected", "[OK]".green()),
                Err(e) => eprintln!("{} {}", "[ERROR]".red(), e),
            },
            _ => display(&device.serial_write(command, &parse_params(rest))),
        }
    }

    if let Err(e) = device.disconnect() {
        eprintln!("{} {}", "[ERROR]".red(), e);
    }
}

// Whitespace-separated JSON values; bare words become strings.
fn parse_params(text: &str) -> Vec<Value> {
    let stream: Result<Vec<Value>, _> = serde_json::Deserializer::from_str(text)
        .into_iter::<Value>()
        .collect();
    match stream {
        Ok(values) => values,
        Err(_) => text
            .split_whitespace()
            .map(|word| {
                serde_json::from_str(word).unwrap_or_else(|_| Value::String(word.to_string()))
            })
            .collect(),
    }
}

fn display(result: &WriteResult) {
    let data = serde_json::to_string_pretty(&result.data).unwrap_or_default();
    if result.success {
        println!("{} {}", "[OK]".green(), data);
    } else {
        eprintln!(
            "{} {}",
            "[ERROR]".red(),
            result.info.as_deref().unwrap_or("command failed")
        );
        if !result.data.is_null() {
            eprintln!("{}", data.dim());
        }
    }
}
