//! ele-pkcs11 CLI: inspect and exercise the EdgeLock Enclave token
//!
//! Commands:
//!   ele-pkcs11 status      probe the device node and the enclave
//!   ele-pkcs11 info        module and token information
//!   ele-pkcs11 slots       list slots
//!   ele-pkcs11 mechanisms  list mechanisms and their capabilities
//!   ele-pkcs11 keygen      generate an EC key pair
//!   ele-pkcs11 sign        generate a key, sign and verify a message
//!   ele-pkcs11 demo        walk the full session scenario on the simulated enclave

use std::env;
use std::process;

use ele_pkcs11::channel::{device_present, SimulatedEnclave};
use ele_pkcs11::logging;
use ele_pkcs11::{
    EcCurve, Mechanism, Module, ModuleConfig, ObjectHandle, PrivateKeyTemplate,
    PublicKeyTemplate, SessionHandle, SessionMode, TokenError, SLOT_ID,
};

fn print_usage() {
    println!(
        r#"
ele-pkcs11 {}: PKCS#11 token for the i.MX93 EdgeLock Enclave

Usage: ele-pkcs11 [--simulated] <command> [options]

Commands:
  status                     Check the device node and probe the enclave
  info [--json]              Show module and token information
  slots                      List slots
  mechanisms                 List supported mechanisms
  keygen [p256|p384]         Generate a key pair and print the public point
  sign <text>                Sign <text> with ECDSA-SHA256 and verify it
  demo                       Run the full scenario on the simulated enclave

Options:
  --simulated                Use the built-in simulated enclave instead of the device node

Environment:
  ELE_PKCS11_CONFIG          JSON config file
  ELE_PKCS11_DEVICE          Device node (default /dev/ele_mu)
  ELE_PKCS11_TIMEOUT_MS      Per-command timeout
  ELE_PKCS11_LOG             Log filter (default info)
"#,
        env!("CARGO_PKG_VERSION")
    );
}

fn main() {
    logging::init();

    let mut args: Vec<String> = env::args().skip(1).collect();
    let simulated = take_flag(&mut args, "--simulated");
    if args.is_empty() {
        print_usage();
        return;
    }

    let result = match args[0].as_str() {
        "status" => cmd_status(simulated),
        "info" => cmd_info(simulated, &args[1..]),
        "slots" => cmd_slots(simulated),
        "mechanisms" => cmd_mechanisms(simulated),
        "keygen" => cmd_keygen(simulated, &args[1..]),
        "sign" => cmd_sign(simulated, &args[1..]),
        "demo" => cmd_demo(),
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other);
            print_usage();
            process::exit(2);
        }
    };

    if let Err(e) = result {
        eprintln!("  Error: {} (rv {})", e, e.return_value());
        process::exit(1);
    }
}

fn take_flag(args: &mut Vec<String>, flag: &str) -> bool {
    let before = args.len();
    args.retain(|a| a != flag);
    args.len() != before
}

/// Load configuration and build the module, without initializing it
fn build_module(simulated: bool) -> Module {
    if simulated {
        return Module::simulated(&SimulatedEnclave::new());
    }
    match ModuleConfig::from_env() {
        Ok(config) => Module::with_device(config),
        Err(e) => {
            eprintln!("  Failed to load configuration: {}", e);
            process::exit(1);
        }
    }
}

fn open_module(simulated: bool) -> Result<Module, TokenError> {
    let module = build_module(simulated);
    module.initialize()?;
    Ok(module)
}

fn cmd_status(simulated: bool) -> Result<(), TokenError> {
    let module = build_module(simulated);

    println!("\n  Enclave Status");
    println!("  {}", "=".repeat(40));
    if !simulated {
        let path = &module.config().device_path;
        println!("  Device node:     {}", path.display());
        println!("  Node present:    {}", device_present(path));
    }
    println!("  Channel:         {}", module.channel().location());

    match module.initialize() {
        Ok(()) => {
            println!("  Probe:           ok");
            println!("  Module ID:       {}", module.id());
            module.finalize()
        }
        Err(e) => {
            println!("  Probe:           failed ({})", e);
            Err(e)
        }
    }
}

fn cmd_info(simulated: bool, args: &[String]) -> Result<(), TokenError> {
    let module = open_module(simulated)?;
    let info = module.info()?;
    let token = module.token_info(SLOT_ID)?;

    if args.iter().any(|a| a == "--json") {
        let report = serde_json::json!({ "module": info, "token": token });
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("  Failed to serialize: {}", e),
        }
    } else {
        println!("\n  Module");
        println!("  {}", "=".repeat(40));
        println!(
            "  Cryptoki:        {}.{}",
            info.cryptoki_version.major, info.cryptoki_version.minor
        );
        println!("  Manufacturer:    {}", info.manufacturer_id);
        println!("  Library:         {} {}", info.library_description, info.library_version);
        println!("\n  Token");
        println!("  {}", "=".repeat(40));
        println!("  Label:           {}", token.label);
        println!("  Model:           {}", token.model);
        println!("  Serial:          {}", token.serial_number);
        println!("  RNG:             {}", token.flags.rng);
        println!("  Login required:  {}", token.flags.login_required);
        println!(
            "  Sessions:        {}/{} ({} rw)",
            token.session_count, token.max_session_count, token.rw_session_count
        );
        println!("  UTC time:        {}", token.utc_time.format("%Y-%m-%d %H:%M:%S"));
    }
    module.finalize()
}

fn cmd_slots(simulated: bool) -> Result<(), TokenError> {
    let module = open_module(simulated)?;
    for slot in module.enumerate_slots()? {
        let info = module.slot_info(slot.id)?;
        println!(
            "  Slot {}: {} [{}] token_present={} read_only_sessions={}",
            slot.id, info.description, info.location, slot.token_present, slot.supports_read_only
        );
    }
    module.finalize()
}

fn cmd_mechanisms(simulated: bool) -> Result<(), TokenError> {
    let module = open_module(simulated)?;
    println!("\n  {:<28} {:>6} {:>6}  flags", "mechanism", "min", "max");
    for mechanism in module.mechanism_list(SLOT_ID)? {
        let info = module.mechanism_info(SLOT_ID, mechanism)?;
        let mut flags = vec!["hw"];
        if info.flags.generate_key_pair {
            flags.push("keygen");
        }
        if info.flags.sign {
            flags.push("sign");
        }
        if info.flags.verify {
            flags.push("verify");
        }
        println!(
            "  {:<28} {:>6} {:>6}  {}",
            mechanism.to_string(),
            info.min_key_bits,
            info.max_key_bits,
            flags.join(",")
        );
    }
    module.finalize()
}

fn parse_curve(arg: Option<&String>) -> EcCurve {
    match arg.map(|s| s.as_str()) {
        Some("p384") | Some("P-384") => EcCurve::P384,
        _ => EcCurve::P256,
    }
}

fn generate(
    module: &Module,
    session: SessionHandle,
    curve: EcCurve,
    label: &str,
) -> Result<(ObjectHandle, ObjectHandle), TokenError> {
    module.generate_key_pair(
        session,
        Mechanism::EcKeyPairGen,
        &PublicKeyTemplate::for_curve(curve).with_label(label),
        &PrivateKeyTemplate::default().with_label(label),
    )
}

fn cmd_keygen(simulated: bool, args: &[String]) -> Result<(), TokenError> {
    let curve = parse_curve(args.first());
    let module = open_module(simulated)?;
    let session = module.open_session(SLOT_ID, SessionMode::ReadWrite)?;

    println!("\n  Generating {} key pair...", curve.name());
    let (public, private) = generate(&module, session, curve, "cli")?;
    let entry = module.object_info(public)?;
    println!("  Public handle:   {}", public);
    println!("  Private handle:  {}", private);
    if let Some(point) = entry.attributes.ec_point {
        println!("  EC point:        {}", hex::encode(point));
    }

    module.close_session(session)?;
    module.finalize()
}

fn cmd_sign(simulated: bool, args: &[String]) -> Result<(), TokenError> {
    let message = match args.first() {
        Some(m) => m.clone(),
        None => {
            eprintln!("Usage: ele-pkcs11 sign <text>");
            return Ok(());
        }
    };

    let module = open_module(simulated)?;
    let session = module.open_session(SLOT_ID, SessionMode::ReadWrite)?;
    let (public, private) = generate(&module, session, EcCurve::P256, "cli-sign")?;

    module.sign_init(session, Mechanism::EcdsaSha256, private)?;
    let signature = module.sign(session, message.as_bytes())?;
    println!("  Message:         {}", message);
    println!("  Signature:       {}", hex::encode(&signature));

    module.verify_init(session, Mechanism::EcdsaSha256, public)?;
    match module.verify(session, message.as_bytes(), &signature) {
        Ok(()) => println!("  Verified:        yes"),
        Err(e) => println!("  Verified:        no ({})", e),
    }

    module.close_session(session)?;
    module.finalize()
}

fn cmd_demo() -> Result<(), TokenError> {
    println!("\n  EdgeLock Enclave token: simulated walkthrough");
    println!("  {}", "=".repeat(50));

    let enclave = SimulatedEnclave::new();
    let module = Module::simulated(&enclave);

    println!("\nStep 1: Initialize");
    module.initialize()?;
    let slots = module.enumerate_slots()?;
    println!("  {} slot(s), first id {}", slots.len(), slots[0].id);

    println!("\nStep 2: Open a read-write session and generate a P-256 key pair");
    let h1 = module.open_session(SLOT_ID, SessionMode::ReadWrite)?;
    let (hpub, hpriv) = generate(&module, h1, EcCurve::P256, "demo")?;
    println!("  session={} public={} private={}", h1, hpub, hpriv);

    println!("\nStep 3: Multi-part ECDSA-SHA256 sign");
    module.sign_init(h1, Mechanism::EcdsaSha256, hpriv)?;
    match module.sign_init(h1, Mechanism::EcdsaSha256, hpriv) {
        Err(e) => println!("  second sign_init rejected: {} (rv {})", e, e.return_value()),
        Ok(()) => println!("  second sign_init unexpectedly accepted"),
    }
    module.sign_update(h1, b"boot image ")?;
    module.sign_update(h1, b"v1.2.0")?;
    let signature = module.sign_final(h1)?;
    println!("  signature: {}", hex::encode(&signature));

    println!("\nStep 4: Verify");
    module.verify_init(h1, Mechanism::EcdsaSha256, hpub)?;
    module.verify(h1, b"boot image v1.2.0", &signature)?;
    println!("  signature verified");

    println!("\nStep 5: Unsupported verbs are rejected cleanly");
    if let Err(e) = module.encrypt_init(h1, Mechanism::AesGcm, hpub) {
        println!("  encrypt_init: {} (rv {})", e, e.return_value());
    }

    println!("\nStep 6: Enclave RNG");
    println!("  {}", hex::encode(module.generate_random(h1, 16)?));

    println!("\nStep 7: Close the session; objects outlive it");
    module.close_session(h1)?;
    println!("  private key still present: {}", module.objects().lookup(hpriv).is_ok());

    println!("\nStep 8: Finalize");
    module.finalize()?;
    println!(
        "  private key after finalize: {}",
        match module.objects().lookup(hpriv) {
            Ok(_) => "present".to_string(),
            Err(e) => e.to_string(),
        }
    );
    println!("  enclave commands handled: {}", enclave.handled().len());
    Ok(())
}
