//! Bot commands. Parsing comes from teloxide; each command is a plain
//! function of the store so it can be exercised without Telegram.

use teloxide::utils::command::BotCommands;
use tracing::info;

use crate::relay::store::{Store, StoreResult};

const NOT_MOD: &str = "Apenas moderadores podem usar este comando.";

#[derive(BotCommands, Clone, Debug, PartialEq)]
#[command(rename_rule = "snake_case", description = "Comandos disponíveis:")]
pub enum Command {
    #[command(description = "começar a conversa")]
    Start,
    #[command(description = "mostrar esta ajuda")]
    Help,
    #[command(description = "contar algo sobre você: /teach <informação>")]
    Teach(String),
    #[command(description = "ver ou mudar a personalidade do chat (moderadores): /personalidade <rótulo>")]
    Personalidade(String),
    #[command(description = "instruções permanentes: /instruction list | add <texto> | remove <texto>")]
    Instruction(String),
    #[command(description = "ver configuração; moderadores: /config nota <user_id> <nota>")]
    Config(String),
    #[command(description = "tornar um usuário moderador: /set_mod <user_id>")]
    SetMod(String),
}

/// Who sent the command, and where.
#[derive(Debug, Clone)]
pub struct Invoker {
    pub chat_id: i64,
    pub user_id: i64,
    pub username: String,
}

/// Run a command and return the text to reply with.
pub fn execute(cmd: &Command, from: &Invoker, store: &dyn Store) -> StoreResult<String> {
    match cmd {
        Command::Start => Ok(format!(
            "Olá, {}! Mande uma mensagem e eu respondo. Use /help para ver os comandos.",
            from.username
        )),
        Command::Help => Ok(Command::descriptions().to_string()),
        Command::Teach(text) => teach(from, text.trim(), store),
        Command::Personalidade(label) => personalidade(from, label.trim(), store),
        Command::Instruction(args) => instruction(from, args.trim(), store),
        Command::Config(args) => config(from, args.trim(), store),
        Command::SetMod(args) => set_mod(from, args.trim(), store),
    }
}

fn teach(from: &Invoker, text: &str, store: &dyn Store) -> StoreResult<String> {
    if text.is_empty() {
        return Ok("Uso: /teach <informação sobre você>".to_string());
    }
    store.set_user_info(from.user_id, &from.username, text)?;
    info!("📝 Recorded info for {} ({})", from.username, from.user_id);
    Ok("Anotado! Vou lembrar disso sobre você.".to_string())
}

fn personalidade(from: &Invoker, label: &str, store: &dyn Store) -> StoreResult<String> {
    if label.is_empty() {
        return Ok(format!("Personalidade atual: {}", store.persona(from.chat_id)?));
    }
    if !store.is_mod(from.user_id)? {
        return Ok(NOT_MOD.to_string());
    }
    store.set_persona(from.chat_id, label)?;
    info!("🎭 Persona of chat {} set to {:?} by {}", from.chat_id, label, from.user_id);
    Ok(format!("Personalidade alterada para: {label}"))
}

fn instruction(from: &Invoker, args: &str, store: &dyn Store) -> StoreResult<String> {
    let (action, text) = match args.split_once(char::is_whitespace) {
        Some((action, text)) => (action, text.trim()),
        None => (args, ""),
    };

    match action {
        "" | "list" => {
            let instructions = store.list_instructions()?;
            if instructions.is_empty() {
                return Ok("Nenhuma instrução cadastrada.".to_string());
            }
            let lines: Vec<String> = instructions
                .iter()
                .enumerate()
                .map(|(i, text)| format!("{}. {}", i + 1, text))
                .collect();
            Ok(format!("Instruções:\n{}", lines.join("\n")))
        }
        "add" | "remove" => {
            if !store.is_mod(from.user_id)? {
                return Ok(NOT_MOD.to_string());
            }
            if text.is_empty() {
                return Ok(format!("Uso: /instruction {action} <texto>"));
            }
            if action == "add" {
                store.add_instruction(text)?;
                info!("📌 Instruction added by {}: {:?}", from.user_id, text);
                Ok("Instrução adicionada.".to_string())
            } else if store.remove_instruction(text)? {
                info!("📌 Instruction removed by {}: {:?}", from.user_id, text);
                Ok("Instrução removida.".to_string())
            } else {
                Ok("Instrução não encontrada.".to_string())
            }
        }
        _ => Ok("Uso: /instruction list | add <texto> | remove <texto>".to_string()),
    }
}

fn config(from: &Invoker, args: &str, store: &dyn Store) -> StoreResult<String> {
    if args.is_empty() {
        let persona = store.persona(from.chat_id)?;
        let instructions = store.list_instructions()?.len();
        let user = store.find_user(from.user_id)?;

        let mut lines = vec![
            format!("Personalidade: {persona}"),
            format!("Instruções: {instructions}"),
            format!("Moderador: {}", if user.as_ref().is_some_and(|u| u.is_mod) { "sim" } else { "não" }),
        ];
        if let Some(score) = user.as_ref().and_then(|u| u.treatment_score) {
            lines.push(format!("Nota de tratamento: {score}"));
        }
        if let Some(info) = user.as_ref().and_then(|u| u.info.as_deref()) {
            lines.push(format!("Sobre você: {info}"));
        }
        return Ok(lines.join("\n"));
    }

    const USAGE: &str = "Uso: /config nota <user_id> <nota>";
    let parts: Vec<&str> = args.split_whitespace().collect();
    let ["nota", user_id, score] = parts.as_slice() else {
        return Ok(USAGE.to_string());
    };
    if !store.is_mod(from.user_id)? {
        return Ok(NOT_MOD.to_string());
    }
    let (Ok(user_id), Ok(score)) = (user_id.parse::<i64>(), score.parse::<i64>()) else {
        return Ok(USAGE.to_string());
    };

    store.set_treatment_score(user_id, score)?;
    info!("Treatment score of {} set to {} by {}", user_id, score, from.user_id);
    Ok(format!("Nota de tratamento de {user_id} definida para {score}."))
}

fn set_mod(from: &Invoker, args: &str, store: &dyn Store) -> StoreResult<String> {
    if !store.is_mod(from.user_id)? {
        return Ok(NOT_MOD.to_string());
    }
    let Ok(user_id) = args.parse::<i64>() else {
        return Ok("Uso: /set_mod <user_id>".to_string());
    };

    store.set_moderator(user_id, true)?;
    info!("🛡️ {} promoted {} to moderator", from.user_id, user_id);
    Ok(format!("Usuário {user_id} agora é moderador."))
}
