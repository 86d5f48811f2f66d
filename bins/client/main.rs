use resident_hub::defs::{DEFAULT_MAX_FRAME_LEN, READ_CHUNK_SIZE};
use resident_hub::errors::CliError;
use resident_hub::protocol::{FrameDecoder, Reply, Request};
use resident_hub::snapshot::{CurrencySnapshot, WeatherSnapshot, WirePayload};
use std::io::{self, BufRead, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::thread;
use structopt::StructOpt;

/// Command-line options for the client
#[derive(Debug, StructOpt)]
#[structopt(name = "resident_client", about = "Terminal client for the resident chat server")]
struct Opt {
    /// TCP server address, e.g., 127.0.0.1:9000
    #[structopt(short, long, default_value = "127.0.0.1:9000")]
    server_addr: String,
}

/// One line of user input.
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Send(Request),
    Help,
    Exit,
}

const USAGE: &str = "Commands: reg <name> <apt> | sub | usb | msg <text> | wth | cur | help | exit";

fn parse_input(line: &str) -> Result<Command, String> {
    let line = line.trim();
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };

    let request = match word.to_lowercase().as_str() {
        "exit" => return Ok(Command::Exit),
        "help" => return Ok(Command::Help),
        "reg" => match rest.rsplit_once(char::is_whitespace) {
            // The apartment is the last word; everything before it is the name.
            Some((name, apt)) if !name.trim().is_empty() => Request::Register {
                name: name.trim().to_string(),
                apartment_no: apt.to_string(),
            },
            _ => return Err("usage: reg <name> <apt>".into()),
        },
        "sub" => Request::Subscribe,
        "usb" => Request::Unsubscribe,
        "msg" if !rest.is_empty() => Request::Chat(rest.to_string()),
        "msg" => return Err("usage: msg <text>".into()),
        "wth" => Request::WeatherQuery,
        "cur" => Request::CurrencyQuery,
        other => return Err(format!("unknown command '{}'", other)),
    };
    Ok(Command::Send(request))
}

/// Human-readable form of a server frame.
fn render(reply: &Reply) -> String {
    match reply {
        Reply::Greeting(text) => text.clone(),
        Reply::Registered(id) => format!("Registered as {}", id),
        Reply::Ok => "OK".to_string(),
        Reply::Err(reason) => format!("Error: {}", reason),
        Reply::Chat(line) => line.clone(),
        Reply::Weather(json) => match WeatherSnapshot::from_payload(json) {
            Ok(w) => format!(
                "Weather: {:.1} C, wind {:.1} km/h from {:.0} deg",
                w.temperature, w.wind_speed, w.wind_direction
            ),
            Err(e) => format!("Weather unavailable: {}", e),
        },
        Reply::Currency(json) => match CurrencySnapshot::from_payload(json) {
            Ok(c) => format!(
                "Rates: USD {:.4} | EUR {:.4} | GBP {:.4} | Gold/g {:.2} | BTC {:.2}",
                c.usd, c.eur, c.gbp, c.gold_gram, c.btc
            ),
            Err(e) => format!("Currency unavailable: {}", e),
        },
    }
}

/// Prints every frame the server sends until the connection closes.
fn listen(mut stream: TcpStream) {
    let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_LEN);
    let mut buf = [0u8; READ_CHUNK_SIZE];

    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                eprintln!("\nConnection error: {}", e);
                break;
            }
        };
        decoder.push(&buf[..n]);

        while let Some(next) = decoder.next_frame() {
            match next {
                Ok(frame) => match Reply::from_frame(frame.clone()) {
                    Some(reply) => println!("\n{}", render(&reply)),
                    None => println!("\n(unrecognised) {}", frame),
                },
                Err(e) => eprintln!("\nBad frame from server: {}", e),
            }
        }
        print!("resident> ");
        let _ = io::stdout().flush();
    }
    println!("\nServer closed connection. Type 'exit' to quit.");
}

fn main() -> Result<(), CliError> {
    let opt = Opt::from_args();

    let mut stream = TcpStream::connect(&opt.server_addr)?;
    println!("Connected to server at {}", opt.server_addr);
    println!("{}", USAGE);

    let reader = stream.try_clone()?;
    let listener = thread::spawn(move || listen(reader));

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("resident> ");
        io::stdout().flush()?;

        let Some(line) = lines.next() else {
            break;
        };
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        match parse_input(&line) {
            Ok(Command::Exit) => break,
            Ok(Command::Help) => println!("{}", USAGE),
            Ok(Command::Send(request)) => {
                if let Err(e) = stream.write_all(&request.to_frame().encode()) {
                    eprintln!("Send failed: {}", e);
                    break;
                }
            }
            Err(msg) => eprintln!("{}", msg),
        }
    }

    println!("Exiting client.");
    let _ = stream.shutdown(Shutdown::Both);
    let _ = listener.join();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_input() {
        assert_eq!(
            parse_input("reg Ada 101"),
            Ok(Command::Send(Request::Register {
                name: "Ada".into(),
                apartment_no: "101".into()
            }))
        );
        assert_eq!(
            parse_input("msg hello | all"),
            Ok(Command::Send(Request::Chat("hello | all".into())))
        );
        assert_eq!(parse_input("SUB"), Ok(Command::Send(Request::Subscribe)));
        assert_eq!(parse_input("exit"), Ok(Command::Exit));
    }

    #[test]
    fn test_parse_register_with_multi_word_name() {
        assert_eq!(
            parse_input("reg  Akıncan Kılıç   12"),
            Ok(Command::Send(Request::Register {
                name: "Akıncan Kılıç".into(),
                apartment_no: "12".into()
            }))
        );
    }

    #[test]
    fn test_parse_input_errors() {
        assert!(parse_input("reg Ada").is_err());
        assert!(parse_input("msg").is_err());
        assert!(parse_input("dance").is_err());
    }

    #[test]
    fn test_render_snapshots() {
        let weather = WeatherSnapshot {
            temperature: 21.04,
            wind_speed: 3.0,
            wind_direction: 90.0,
            observed_at: 1,
        };
        assert_eq!(
            render(&Reply::Weather(weather.to_payload())),
            "Weather: 21.0 C, wind 3.0 km/h from 90 deg"
        );
        assert!(render(&Reply::Currency("{\"usd\":1}".into())).starts_with("Currency unavailable"));
        assert_eq!(render(&Reply::Err("not registered".into())), "Error: not registered");
    }

    #[test]
    fn test_server_frames_render_after_decoding() {
        let mut wire = Vec::new();
        wire.extend(Reply::Chat("[09:00:00][101] Ada: hi | all".into()).encode());
        wire.extend(Reply::Registered("Ada_101".into()).encode());

        let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_LEN);
        decoder.push(&wire[..7]);
        decoder.push(&wire[7..]);
        let rendered: Vec<String> = std::iter::from_fn(|| decoder.next_frame())
            .map(|frame| render(&Reply::from_frame(frame.unwrap()).unwrap()))
            .collect();

        assert_eq!(
            rendered,
            vec!["[09:00:00][101] Ada: hi | all", "Registered as Ada_101"]
        );
    }
}
