// CraftPay CLI - operator client for the escrow server

mod callback;
mod client;

use clap::{Parser, Subcommand};
use colored::Colorize;
use serde_json::{json, Value};
use uuid::Uuid;

use callback::SimulatedResult;
use client::{ApiClient, ApiResponse};

/// CraftPay - escrow payment operations
#[derive(Parser)]
#[command(name = "craftpay")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Server base URL
    #[arg(long, env = "CRAFTPAY_SERVER", default_value = "http://localhost:8080", global = true)]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the payment for an order
    Status {
        order_id: Uuid,
    },
    /// Start collection for an order (sends the payment prompt to the payer)
    Collect {
        order_id: Uuid,

        /// Payer phone, defaults to the buyer's registered phone
        #[arg(short, long)]
        phone: Option<String>,

        /// Short description shown to the payer
        #[arg(short, long)]
        description: Option<String>,
    },
    /// Confirm delivery on the buyer's behalf and release funds
    Confirm {
        order_id: Uuid,
    },
    /// Release funds to the seller without delivery confirmation
    Release {
        order_id: Uuid,
    },
    /// Return funds to the buyer
    Refund {
        order_id: Uuid,

        /// Why the buyer is being refunded
        #[arg(short, long)]
        reason: String,
    },
    /// Run one auto-release sweep now
    Sweep,
    /// Post a fake gateway result for a pending collection
    SimulateCallback {
        /// CheckoutRequestID returned when collection started
        checkout_request_id: String,

        /// Amount the payer paid (whole shillings)
        #[arg(short, long, required_unless_present = "decline")]
        amount: Option<u64>,

        /// Payer phone reported by the gateway
        #[arg(short, long, default_value = "254708374149")]
        phone: String,

        /// Receipt number, random if omitted
        #[arg(long)]
        receipt: Option<String>,

        /// Simulate a failure with this result code (e.g. 1032 = cancelled)
        #[arg(long, value_name = "RESULT_CODE")]
        decline: Option<i64>,
    },
}

fn main() {
    let cli = Cli::parse();
    let client = ApiClient::new(&cli.server);

    let result = match cli.command {
        Commands::Status { order_id } => handle_status(&client, order_id),
        Commands::Collect {
            order_id,
            phone,
            description,
        } => handle_collect(&client, order_id, phone, description),
        Commands::Confirm { order_id } => handle_outcome(
            &client,
            "/api/v1/payments/confirm-delivery",
            json!({ "orderId": order_id }),
        ),
        Commands::Release { order_id } => handle_outcome(
            &client,
            "/api/v1/payments/release",
            json!({ "orderId": order_id }),
        ),
        Commands::Refund { order_id, reason } => handle_outcome(
            &client,
            "/api/v1/payments/refund",
            json!({ "orderId": order_id, "reason": reason }),
        ),
        Commands::Sweep => handle_sweep(&client),
        Commands::SimulateCallback {
            checkout_request_id,
            amount,
            phone,
            receipt,
            decline,
        } => handle_simulate(&client, &checkout_request_id, amount, phone, receipt, decline),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn handle_status(client: &ApiClient, order_id: Uuid) -> anyhow::Result<()> {
    let response = client.get(&format!("/api/v1/payments/{}", order_id))?;
    if !response.is_success() {
        return Err(server_error(&response));
    }
    print_payment(&response.body);
    Ok(())
}

fn handle_collect(
    client: &ApiClient,
    order_id: Uuid,
    phone: Option<String>,
    description: Option<String>,
) -> anyhow::Result<()> {
    let response = client.post(
        "/api/v1/payments/collect",
        &json!({
            "orderId": order_id,
            "payerPhone": phone,
            "description": description,
        }),
    )?;
    if !response.is_success() {
        return Err(server_error(&response));
    }

    println!("{} {}", "✓".green().bold(), "Payment prompt sent".green());
    print_payment(&response.body);
    if let Some(checkout) = response.body["externalRef"].as_str() {
        println!();
        println!("Simulate the payer with:");
        println!(
            "  craftpay simulate-callback {} --amount {}",
            checkout,
            response.body["amount"]
                .as_str()
                .and_then(|a| a.split('.').next())
                .unwrap_or("<amount>")
        );
    }
    Ok(())
}

/// Release, refund and confirm all answer with an outcome.
fn handle_outcome(client: &ApiClient, path: &str, body: Value) -> anyhow::Result<()> {
    let response = client.post(path, &body)?;

    match response.body["outcome"].as_str() {
        Some("succeeded") => {
            println!("{} {}", "✓".green().bold(), "Succeeded".green());
            print_payment(&response.body["payment"]);
            Ok(())
        }
        Some("already_handled") => {
            println!(
                "{} Already handled (payment is {})",
                "•".yellow().bold(),
                response.body["status"].as_str().unwrap_or("unknown")
            );
            Ok(())
        }
        Some("retry_later") => {
            eprintln!("{} {}", "✗".yellow().bold(), "Gateway unavailable, retry later".yellow());
            Err(server_error(&response))
        }
        Some("failed") => {
            eprintln!(
                "{} {}",
                "✗".red().bold(),
                "Gateway rejected the request; operator attention required".red()
            );
            Err(server_error(&response))
        }
        _ => Err(server_error(&response)),
    }
}

fn handle_sweep(client: &ApiClient) -> anyhow::Result<()> {
    let response = client.post("/api/v1/payments/sweep", &json!({}))?;
    if !response.is_success() {
        return Err(server_error(&response));
    }

    let report = &response.body;
    println!("{}", "Auto-release sweep".bold());
    for (label, key) in [
        ("Examined", "examined"),
        ("Released", "released"),
        ("Skipped (confirmed)", "skipped"),
        ("Already handled", "alreadyHandled"),
        ("Failed", "failed"),
    ] {
        println!("  {:<22} {}", label, report[key]);
    }

    let stale = report["staleClaims"].as_u64().unwrap_or(0);
    if stale > 0 {
        println!(
            "  {:<22} {}",
            "Stale claims".red(),
            stale.to_string().red().bold()
        );
        println!("  Stale claims need manual reconciliation against the gateway.");
    }
    Ok(())
}

fn handle_simulate(
    client: &ApiClient,
    checkout_request_id: &str,
    amount: Option<u64>,
    phone: String,
    receipt: Option<String>,
    decline: Option<i64>,
) -> anyhow::Result<()> {
    let result = match (decline, amount) {
        (Some(code), _) => SimulatedResult::Declined {
            code,
            description: "Simulated failure".to_string(),
        },
        (None, Some(amount)) => SimulatedResult::Paid {
            amount,
            receipt: receipt.unwrap_or_else(callback::random_receipt),
            phone,
        },
        (None, None) => anyhow::bail!("--amount is required unless --decline is given"),
    };

    let body = callback::stk_callback(checkout_request_id, &result, chrono::Utc::now());
    let response = client.post("/api/v1/payments/callback", &body)?;
    if !response.is_success() {
        return Err(server_error(&response));
    }

    println!(
        "{} Callback for {} acknowledged",
        "✓".green().bold(),
        checkout_request_id
    );
    Ok(())
}

fn print_payment(payment: &Value) {
    let field = |key: &str| payment[key].as_str().unwrap_or("-").to_string();

    let status = field("status");
    let colored_status = match status.as_str() {
        "held" => status.cyan(),
        "released" | "refunded" => status.green(),
        "failed" => status.red(),
        "releasing" | "refunding" => status.yellow(),
        _ => status.normal(),
    };

    println!("  Payment:   {}", field("id"));
    println!("  Order:     {}", field("orderId"));
    println!("  Status:    {}", colored_status.bold());
    println!("  Amount:    KES {}", field("amount"));
    println!("  Payer:     {}", field("payerPhone"));
    println!("  Payee:     {}", field("payeePhone"));
    for (label, key) in [
        ("Checkout", "externalRef"),
        ("Receipt", "receiptNumber"),
        ("Payout", "payoutReference"),
        ("Reversal", "refundReference"),
        ("Failure", "failureReason"),
        ("Refund", "refundReason"),
        ("Paid", "paidAt"),
        ("Released", "releasedAt"),
        ("Refunded", "refundedAt"),
    ] {
        if let Some(value) = payment[key].as_str() {
            println!("  {:<10} {}", format!("{}:", label), value);
        }
    }
}

fn server_error(response: &ApiResponse) -> anyhow::Error {
    let detail = response.body["error"]
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| response.body.to_string());
    anyhow::anyhow!("Server returned {}: {}", response.status, detail)
}
