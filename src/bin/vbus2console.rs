use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use structopt::StructOpt;

use vbus::frame::{Frame, PacketMsg, TelegramMsg};
use vbus::vsf::Language;
use vbus::{FrameReader, ReaderOptions, VbusSpec};

#[derive(StructOpt, Debug)]
#[structopt(about = "Reads and interprets RESOL VBus data from a serial port.")]
struct Opt {
    #[structopt(short = "p", long = "port", help = "Serial port.")]
    port: String,

    #[structopt(short = "b", long = "baudrate", default_value = "9600")]
    baudrate: u32,

    #[structopt(
        short = "v",
        long = "vsf",
        parse(from_os_str),
        default_value = "vbus_specification.vsf",
        help = "VBus specification file, used to decode packet data."
    )]
    vsf: PathBuf,

    #[structopt(
        short = "l",
        long = "lang",
        default_value = "EN",
        possible_values = &["EN", "DE", "FR"],
        help = "Language for field names and descriptions."
    )]
    lang: Language,
}

fn main() -> Result<()> {
    env_logger::init();
    let opt = Opt::from_args();

    let spec = match VbusSpec::load(&opt.vsf) {
        Ok(spec) => Some(spec),
        Err(e) => {
            eprintln!("VSF file could not be loaded ({}); dumping raw frames only.", e);
            None
        }
    };

    let port = serialport::new(&opt.port, opt.baudrate)
        .timeout(Duration::from_secs(5))
        .open()
        .context("serial port could not be opened; is it used by another application?")?;

    let mut reader = FrameReader::new(port, ReaderOptions { ignore_timeout: true });
    for frame in reader.frames() {
        print_frame(&frame.context("serial read failed")?, spec.as_ref(), opt.lang);
    }

    Ok(())
}

fn device_name(spec: Option<&VbusSpec>, addr: u16, lang: Language) -> String {
    spec.and_then(|s| {
        s.device(addr, None)
            .and_then(|dev| s.localize(dev.name_index, lang))
    })
    .unwrap_or("<unknown>")
    .to_owned()
}

fn print_frame(frame: &Frame, spec: Option<&VbusSpec>, lang: Language) {
    println!("-----------------");

    match frame {
        Frame::Packet(msg) => {
            print_addresses(spec, msg.src, msg.dst, lang);
            print_raw_payload(&msg.payload);
            if !msg.checksum_ok {
                println!("  CHECKSUM NOT OK, SKIPPED");
                return;
            }
            println!("  VER: v1.0 packet");
            println!("  CMD: 0x{:04X}", msg.command);
            print_fields(msg, spec, lang);
        }
        Frame::Datagram(msg) => {
            print_addresses(spec, msg.src, msg.dst, lang);
            if !msg.checksum_ok {
                println!("  CHECKSUM NOT OK, SKIPPED");
                return;
            }
            println!("  VER: v2.0 datagram");
            println!("  CMD: 0x{:04X} - {:?}", msg.command_raw, msg.command);
            println!("  ID: {}", msg.id);
            println!("  VAL: 0x{:08X} == {}", msg.value, msg.value);
        }
        Frame::Telegram(msg) => {
            print_addresses(spec, msg.src, msg.dst, lang);
            print_raw_payload(&msg.buffer);
            match msg.protocol {
                TelegramMsg::PROTOCOL_3V0 => println!("  VER: v3.0 telegram"),
                _ => println!("  VER: v3.1 telegram"),
            }
        }
        Frame::Garbage(msg) => {
            println!("  GARBAGE, {} byte(s):", msg.bytes.len());
            print_raw_payload(&msg.bytes);
        }
    }
}

fn print_addresses(spec: Option<&VbusSpec>, src: u16, dst: u16, lang: Language) {
    println!("  SRC: 0x{:04X} - {}", src, device_name(spec, src, lang));
    println!("  DST: 0x{:04X} - {}", dst, device_name(spec, dst, lang));
}

fn print_raw_payload(bytes: &[u8]) {
    println!("  RAW:");
    for chunk in bytes.chunks(16) {
        let hex: Vec<String> = chunk.iter().map(|b| format!("{:02X}", b)).collect();
        println!("    {}", hex.join(" "));
    }
}

fn print_fields(msg: &PacketMsg, spec: Option<&VbusSpec>, lang: Language) {
    let spec = match spec {
        Some(spec) => spec,
        None => return,
    };
    let template = match spec.packet(msg.src, msg.dst, Some(msg.command)) {
        Some(template) => template,
        None => {
            println!("  Fields: no matching packet template");
            return;
        }
    };

    println!("  Fields:");
    match template.decode(&msg.payload) {
        Ok(decoded) => {
            for (field, value) in decoded {
                let name = spec.localize(field.name_index, lang).unwrap_or("?");
                let unit = spec
                    .unit_by_id(field.unit_id)
                    .and_then(|unit| spec.unit_text(unit))
                    .unwrap_or("");
                println!("    {}\t{}\t{} {}", field.full_id(template), name, value, unit);
            }
        }
        Err(e) => println!("    could not decode payload: {}", e),
    }
}
