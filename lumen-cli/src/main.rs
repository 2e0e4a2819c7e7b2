use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use clap::{Arg, ArgAction, ArgMatches, Command};
use log::{debug, error, info};
use lumen_inference::{ByteTokenizer, Engine, GenerationRequest, ModelConfig, SamplingContext, Tokenizer, Vocabulary};
use lumen_loader::SafeTensorsCheckpoint;

/// What the `generate` subcommand feeds the model.
#[derive(Debug, Clone, PartialEq)]
enum PromptInput {
    /// Comma-separated token ids, one entry per sequence.
    Ids(Vec<Vec<usize>>),
    /// Texts encoded with the byte-level tokenizer.
    Text(Vec<String>),
}

#[derive(Debug, Clone)]
struct RunConfig {
    model_dir: String,
    input: PromptInput,
    temperature: f32,
    top_p: f32,
    max_new_tokens: usize,
    ctx_length: Option<usize>,
    echo: bool,
    logprobs: bool,
    seed: u64,
}

#[derive(Debug, Default)]
struct RunConfigBuilder {
    model_dir: Option<String>,
    input: Option<PromptInput>,
    temperature: Option<f32>,
    top_p: Option<f32>,
    max_new_tokens: Option<usize>,
    ctx_length: Option<usize>,
    echo: bool,
    logprobs: bool,
    seed: Option<u64>,
}

impl RunConfigBuilder {
    fn model_dir(mut self, model_dir: Option<&String>) -> Self {
        self.model_dir = model_dir.cloned();
        self
    }
    fn input(mut self, input: Option<PromptInput>) -> Self {
        self.input = input;
        self
    }
    fn temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }
    fn top_p(mut self, top_p: Option<f32>) -> Self {
        self.top_p = top_p;
        self
    }
    fn max_new_tokens(mut self, max_new_tokens: Option<usize>) -> Self {
        self.max_new_tokens = max_new_tokens;
        self
    }
    fn ctx_length(mut self, ctx_length: Option<usize>) -> Self {
        self.ctx_length = ctx_length;
        self
    }
    fn echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }
    fn logprobs(mut self, logprobs: bool) -> Self {
        self.logprobs = logprobs;
        self
    }
    fn seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }
    fn build(self) -> Result<RunConfig, String> {
        Ok(RunConfig {
            model_dir: self.model_dir.ok_or("model directory is required")?,
            input: self.input.ok_or("either --ids or --text is required")?,
            temperature: self.temperature.unwrap_or(0.6),
            top_p: self.top_p.unwrap_or(0.9),
            max_new_tokens: self.max_new_tokens.unwrap_or(64),
            ctx_length: self.ctx_length,
            echo: self.echo,
            logprobs: self.logprobs,
            seed: self.seed.unwrap_or_else(|| {
                SystemTime::now().duration_since(UNIX_EPOCH).map(|elapsed| elapsed.as_secs()).unwrap_or_default()
            }),
        })
    }
}

/// Parses `"1, 2,3"` into token ids.
fn parse_ids(value: &str) -> Result<Vec<usize>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(|id| id.parse::<usize>().map_err(|_| anyhow::anyhow!("Invalid token id '{id}' in '{value}'")))
        .collect()
}

/// Define the inspect subcommand.
fn inspect_subcommand() -> Command {
    Command::new("inspect")
        .about("Print the configuration of a HuggingFace model directory")
        .arg(
            Arg::new("MODEL_DIR")
                .help("Path to the model directory (containing config.json and *.safetensors)")
                .required(true)
                .index(1),
        )
}

/// Define the generate subcommand.
fn generate_subcommand() -> Command {
    Command::new("generate")
        .about("Generate completions for a batch of prompts")
        .arg(Arg::new("MODEL_DIR").help("Path to the model directory").required(true).index(1))
        .arg(
            Arg::new("ids")
                .long("ids")
                .value_name("IDS")
                .help("Comma-separated prompt token ids; repeat for a batch")
                .action(ArgAction::Append)
                .conflicts_with("text"),
        )
        .arg(
            Arg::new("text")
                .long("text")
                .value_name("STRING")
                .help("Prompt text for byte-level models; repeat for a batch")
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("temperature")
                .short('t')
                .long("temperature")
                .value_name("FLOAT")
                .help("Temperature for sampling, 0 is greedy [default: 0.6]")
                .value_parser(clap::value_parser!(f32)),
        )
        .arg(
            Arg::new("topp")
                .short('p')
                .long("topp")
                .value_name("FLOAT")
                .help("Top-p for nucleus sampling in [0,1] [default: 0.9]")
                .value_parser(clap::value_parser!(f32)),
        )
        .arg(
            Arg::new("seed")
                .short('s')
                .long("seed")
                .value_name("INT")
                .help("Random seed")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("max-new-tokens")
                .short('n')
                .long("max-new-tokens")
                .value_name("INT")
                .help("Tokens to generate per prompt [default: 64]")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("context")
                .short('c')
                .long("context")
                .value_name("INT")
                .help("Context window size, (default) = max_position_embeddings")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(Arg::new("echo").long("echo").help("Prepend the prompt to every completion").action(ArgAction::SetTrue))
        .arg(
            Arg::new("logprobs")
                .long("logprobs")
                .help("Print the log-probability of every token")
                .action(ArgAction::SetTrue),
        )
}

fn run_inspect_command(matches: &ArgMatches) -> Result<()> {
    let model_dir = matches.get_one::<String>("MODEL_DIR").ok_or_else(|| anyhow::anyhow!("MODEL_DIR is required"))?;
    let checkpoint = SafeTensorsCheckpoint::open(model_dir)?;
    let info = checkpoint.info();

    let config = ModelConfig::new(&info.params, info.vocabulary.size, info.max_position_embeddings, 1)?;

    info!("{:#?}", info.params);
    info!("{config:#?}");
    info!("{:?}", info.vocabulary);
    info!("Stored tensors: {}", checkpoint.stored_names().count());

    Ok(())
}

fn run_generate_command(matches: &ArgMatches) -> Result<()> {
    let input = match (matches.get_many::<String>("ids"), matches.get_many::<String>("text")) {
        (Some(ids), _) => Some(PromptInput::Ids(ids.map(|value| parse_ids(value)).collect::<Result<_>>()?)),
        (None, Some(texts)) => Some(PromptInput::Text(texts.cloned().collect())),
        (None, None) => None,
    };

    let config = RunConfigBuilder::default()
        .model_dir(matches.get_one::<String>("MODEL_DIR"))
        .input(input)
        .temperature(matches.get_one::<f32>("temperature").copied())
        .top_p(matches.get_one::<f32>("topp").copied())
        .max_new_tokens(matches.get_one::<usize>("max-new-tokens").copied())
        .ctx_length(matches.get_one::<usize>("context").copied())
        .echo(matches.get_flag("echo"))
        .logprobs(matches.get_flag("logprobs"))
        .seed(matches.get_one::<u64>("seed").copied())
        .build()
        .map_err(|e| anyhow::anyhow!(e))?;

    debug!("{config:#?}");

    let checkpoint = SafeTensorsCheckpoint::open(&config.model_dir)?;
    let batch_size = match &config.input {
        PromptInput::Ids(prompts) => prompts.len(),
        PromptInput::Text(texts) => texts.len(),
    };

    let template = GenerationRequest::new(Vec::new())
        .with_max_new_tokens(config.max_new_tokens)
        .with_temperature(config.temperature)
        .with_top_p(config.top_p)
        .with_echo(config.echo)
        .with_logprobs(config.logprobs);
    let mut sampling = SamplingContext::new(config.seed, batch_size);

    match config.input {
        PromptInput::Ids(prompts) => {
            let mut engine = checkpoint.build_engine(config.ctx_length, batch_size)?;
            let request = GenerationRequest { prompts, ..template };
            let result = engine.generate(&request, &mut sampling)?;

            for (index, completion) in result.completions.iter().enumerate() {
                info!("[{index}] {:?} ({:?})", completion.tokens, completion.stop);
                if let Some(logprobs) = &completion.logprobs {
                    info!("[{index}] logprobs: {logprobs:?}");
                }
            }
        }
        PromptInput::Text(texts) => {
            let model_vocabulary = checkpoint.info().vocabulary;
            if model_vocabulary.size < ByteTokenizer::VOCAB_SIZE {
                anyhow::bail!(
                    "--text needs a byte-level vocabulary of at least {} tokens, the model has {}",
                    ByteTokenizer::VOCAB_SIZE,
                    model_vocabulary.size
                );
            }

            let max_positions = checkpoint.info().max_position_embeddings;
            let vocabulary = Vocabulary { size: model_vocabulary.size, ..ByteTokenizer.vocabulary() };
            let mut engine = Engine::builder(&checkpoint)
                .with_vocabulary(vocabulary)
                .with_max_seq_len(config.ctx_length.map_or(max_positions, |ctx_length| ctx_length.min(max_positions)))
                .with_max_batch_size(batch_size)
                .build()?;

            let prompts = texts.iter().map(String::as_str).collect::<Vec<_>>();
            for (index, text) in engine.generate_text(&ByteTokenizer, &prompts, &template, &mut sampling)?.iter().enumerate() {
                info!("[{index}] {text}");
            }
        }
    }

    Ok(())
}

fn execute_commands() -> Result<()> {
    // Initialize logger with clean format (no timestamp/module prefix)
    env_logger::Builder::from_default_env()
        .format(|buf, record| {
            use std::io::Write;
            writeln!(buf, "{}", record.args())
        })
        .init();

    let matches = Command::new("lumen")
        .about("Lumen CLI: batched text generation with decoder-only transformers")
        .subcommand(inspect_subcommand())
        .subcommand(generate_subcommand())
        .get_matches();

    match matches.subcommand() {
        Some(("inspect", matches)) => run_inspect_command(matches),
        Some(("generate", matches)) => run_generate_command(matches),
        _ => anyhow::bail!("No subcommand specified. Use -h to print help information."),
    }
}

fn main() {
    if let Err(e) = execute_commands() {
        error!("Error: {e}");
        std::process::exit(1);
    }
}
