//! Test Claim Producer
//!
//! Generates and publishes synthetic insurance claims to NATS for pipeline testing.

use clap::Parser;
use claim_fraud_pipeline::Claim;
use rand::rngs::ThreadRng;
use rand::Rng;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "test-producer", about = "Publish synthetic claims to NATS")]
struct Args {
    #[arg(long, default_value = "nats://localhost:4222")]
    nats_url: String,
    #[arg(long, default_value = "claims")]
    subject: String,
    #[arg(long, default_value_t = 100)]
    count: u64,
    /// Share of claims generated from the suspicious profile
    #[arg(long, default_value_t = 0.1)]
    fraud_rate: f64,
    #[arg(long, default_value_t = 500)]
    delay_ms: u64,
}

const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];
const DAYS: [&str; 7] = [
    "Monday", "Tuesday", "Wednesday", "Thursday", "Friday", "Saturday", "Sunday",
];

/// Claim generator for testing
struct ClaimGenerator {
    rng: ThreadRng,
    policy_counter: u64,
}

impl ClaimGenerator {
    fn new() -> Self {
        Self {
            rng: rand::thread_rng(),
            policy_counter: 0,
        }
    }

    /// Fields shared by both profiles
    fn base_claim(&mut self) -> Claim {
        self.policy_counter += 1;
        let month = self.random_choice(&MONTHS);
        Claim::new()
            .with("PolicyNumber", 100_000 + self.policy_counter)
            .with("Month", month)
            .with("WeekOfMonth", self.rng.gen_range(1..=5))
            .with("DayOfWeek", self.random_choice(&DAYS))
            .with("Make", self.random_choice(&["Honda", "Toyota", "Pontiac", "Mazda", "Chevrolet", "VW"]))
            .with("DayOfWeekClaimed", self.random_choice(&DAYS))
            .with("MonthClaimed", month)
            .with("WeekOfMonthClaimed", self.rng.gen_range(1..=5))
            .with("Sex", self.random_choice(&["Male", "Female"]))
            .with("MaritalStatus", self.random_choice(&["Single", "Married", "Widow", "Divorced"]))
            .with("VehicleCategory", self.random_choice(&["Sedan", "Sport", "Utility"]))
            .with("RepNumber", self.rng.gen_range(1..=16))
            .with("DriverRating", self.rng.gen_range(1..=4))
            .with("NumberOfCars", self.random_choice(&["1 vehicle", "2 vehicles"]))
            .with("Year", self.random_choice(&["1994", "1995", "1996"]))
    }

    /// A claim drawn from the common, low-risk profile
    fn generate_legitimate(&mut self) -> Claim {
        let age = self.rng.gen_range(30..75);
        self.base_claim()
            .with("AccidentArea", "Urban")
            .with("Age", age)
            .with("Fault", self.random_choice(&["Policy Holder", "Third Party"]))
            .with("PolicyType", "Sedan - Liability")
            .with("BasePolicy", "Liability")
            .with("VehiclePrice", self.random_choice(&["20000 to 29000", "30000 to 39000"]))
            .with("Deductible", 400)
            .with("Days_Policy_Accident", "more than 30")
            .with("Days_Policy_Claim", "more than 30")
            .with("PastNumberOfClaims", self.random_choice(&["none", "1"]))
            .with("AgeOfVehicle", self.random_choice(&["5 years", "6 years", "7 years"]))
            .with("AgeOfPolicyHolder", "31 to 35")
            .with("PoliceReportFiled", "Yes")
            .with("WitnessPresent", self.random_choice(&["Yes", "No"]))
            .with("AgentType", "External")
            .with("NumberOfSuppliments", "none")
            .with("AddressChange_Claim", "no change")
    }

    /// A claim with the traits fraud rules usually flag
    fn generate_suspicious(&mut self) -> Claim {
        let age = self.rng.gen_range(18..30);
        self.base_claim()
            .with("AccidentArea", "Rural")
            .with("Age", age)
            .with("Fault", "Policy Holder")
            .with("PolicyType", "Sedan - All Perils")
            .with("BasePolicy", "All Perils")
            .with("VehiclePrice", "more than 69000")
            .with("Deductible", self.random_choice(&["500", "700"]))
            .with("Days_Policy_Accident", self.random_choice(&["none", "1 to 7"]))
            .with("Days_Policy_Claim", "8 to 15")
            .with("PastNumberOfClaims", "more than 4")
            .with("AgeOfVehicle", "new")
            .with("AgeOfPolicyHolder", "18 to 20")
            .with("PoliceReportFiled", "No")
            .with("WitnessPresent", "No")
            .with("AgentType", "Internal")
            .with("NumberOfSuppliments", "more than 5")
            .with("AddressChange_Claim", "under 6 months")
    }

    fn random_choice<'a>(&mut self, choices: &[&'a str]) -> &'a str {
        choices[self.rng.gen_range(0..choices.len())]
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("test_producer=info".parse()?),
        )
        .init();

    let args = Args::parse();
    info!(
        nats_url = %args.nats_url,
        subject = %args.subject,
        count = args.count,
        fraud_rate = args.fraud_rate,
        delay_ms = args.delay_ms,
        "Starting Test Claim Producer"
    );

    let client = match async_nats::connect(&args.nats_url).await {
        Ok(c) => {
            info!("Connected to NATS");
            c
        }
        Err(e) => {
            warn!(error = %e, "Failed to connect to NATS. Running in dry-run mode.");
            return run_dry_mode(&args).await;
        }
    };

    let mut generator = ClaimGenerator::new();
    let mut rng = rand::thread_rng();

    let mut legitimate_count = 0;
    let mut suspicious_count = 0;

    for i in 0..args.count {
        let claim = if rng.gen_bool(args.fraud_rate) {
            suspicious_count += 1;
            generator.generate_suspicious()
        } else {
            legitimate_count += 1;
            generator.generate_legitimate()
        };

        let payload = serde_json::to_vec(&claim)?;
        client.publish(args.subject.clone(), payload.into()).await?;

        if (i + 1) % 10 == 0 {
            info!(
                "Published {}/{} claims ({} legitimate, {} suspicious)",
                i + 1,
                args.count,
                legitimate_count,
                suspicious_count
            );
        }

        tokio::time::sleep(Duration::from_millis(args.delay_ms)).await;
    }

    // Publishes are buffered by the client
    client.flush().await?;

    info!(
        "Completed! Published {} claims ({} legitimate, {} suspicious)",
        args.count, legitimate_count, suspicious_count
    );

    Ok(())
}

async fn run_dry_mode(args: &Args) -> anyhow::Result<()> {
    info!("Running in dry-run mode (no NATS connection)");

    let mut generator = ClaimGenerator::new();
    let mut rng = rand::thread_rng();

    for i in 0..args.count {
        let claim = if rng.gen_bool(args.fraud_rate) {
            generator.generate_suspicious()
        } else {
            generator.generate_legitimate()
        };

        if (i + 1) % 10 == 0 || i == 0 {
            info!("Sample claim {}:\n{}", i + 1, serde_json::to_string_pretty(&claim)?);
        }

        tokio::time::sleep(Duration::from_millis(args.delay_ms)).await;
    }

    Ok(())
}
