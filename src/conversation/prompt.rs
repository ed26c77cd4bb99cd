//! 提示组装：人设、护栏、上下文块、KB 块与升级话术
//!
//! 面向客人的文案全部是意大利语（默认语言），护栏要求回答只依据
//! 检索到的 KB 上下文与结构登记，答不了就输出升级哨兵。

use crate::booking::BookingContext;
use crate::kb::{PropertyRegistry, RetrievedKb};

/// 升级哨兵：模型无法安全作答时要求其原样输出的保留 token
pub const HANDOFF_SENTINEL: &str = "HANDOFF_OPERATOR";
/// 护栏里展示给模型的完整标记形式
pub const HANDOFF_SENTINEL_MARKER: &str = "[[HANDOFF_OPERATOR]]";

/// 固定人设：五星级礼宾语气，默认意大利语
pub const AGENT_SYSTEM_PROMPT: &str = "\
Sei un assistente virtuale altamente qualificato che lavora per una struttura alberghiera di lusso. \
Il tuo ruolo è fornire supporto agli ospiti prima, durante e dopo il soggiorno, con lo stesso tono, \
precisione e livello di servizio di un concierge 5 stelle.

Il tuo comportamento deve sempre essere professionale, cortese, proattivo e attento ai dettagli.

Hai piena conoscenza di:
- Servizi e comfort offerti dalla struttura (spa, ristorante, palestra, piscina, room service, tipologie di camere, orari di check-in/check-out)
- Servizi extra (transfer privato, navetta aeroportuale, baby-sitting, pet-friendly)
- Attrazioni locali, eventi, ristoranti e attività esperienziali nella zona
- Politiche della struttura (cancellazioni, pagamenti, fumo, animali, accessi)
- Richieste speciali (compleanni, anniversari, lune di miele)
- Richieste urgenti (manutenzione, pulizie, late check-out)

Il tuo tono:
- È sempre elegante, formale e caloroso, come in un hotel 5 stelle.
- Mantieni sempre un approccio orientato alla soluzione.
- Sei capace di rispondere in più lingue, ma utilizzi l'italiano come lingua predefinita (o quella utilizzata dall'ospite).

Regole speciali:
- Rivolgiti sempre al cliente come \"Sig./Sig.ra/Mx. [Cognome]\" quando noto.
- Non dichiarare mai di essere un assistente virtuale o un'intelligenza artificiale.
- Non condividere mai processi interni o dati sensibili.
- Se non comprendi esattamente la richiesta, fai domande di chiarimento in modo gentile.";

/// 护栏：只依据 KB 上下文与登记作答，答不了输出哨兵，不编造
pub fn guardrails() -> String {
    format!(
        "REGOLE VINCOLANTI:\n\
         - Rispondi usando SOLO le informazioni presenti in 'CONTESTO KB' e nell'anagrafica struttura.\n\
         - Se il contesto non contiene la risposta specifica, NON inventare: rispondi esattamente con '{HANDOFF_SENTINEL_MARKER}'.\n\
         - Non menzionare la knowledge base, retrieval, punteggi o sistemi interni.\n\
         - Mantieni il tono 5 stelle.\n\
         - Usa la lingua del cliente (default italiano)."
    )
}

/// 上下文块：客人姓氏（若知）、booking id、结构登记快照
pub fn context_block(booking: &BookingContext, registry: &PropertyRegistry) -> String {
    let mut lines = Vec::new();
    if let Some(last_name) = &booking.guest_last_name {
        lines.push(format!("Cognome ospite: {last_name}"));
    }
    lines.push(format!("Booking ID: {}", booking.booking_id));

    // 登记里查不到该属性不算错误：快照为空对象
    let snapshot = registry
        .record(&booking.property_id)
        .map(|r| serde_json::to_string(r).unwrap_or_else(|_| "{}".to_string()))
        .unwrap_or_else(|| "{}".to_string());
    lines.push(format!(
        "Anagrafica struttura (property_id={}): {}",
        booking.property_id, snapshot
    ));

    lines.join("\n")
}

/// KB 块：每条带分数、unit 与 ambito 标注
pub fn kb_block(retrieved: &[RetrievedKb]) -> String {
    let mut lines = Vec::with_capacity(retrieved.len());
    for (i, r) in retrieved.iter().enumerate() {
        lines.push(format!(
            "[KB {} | score={:.3} | unit={} | ambito={}]\nDescrizione: {}\nRisposta: {}\n",
            i + 1,
            r.score,
            r.unit.as_deref().unwrap_or("N/A"),
            r.scope.as_deref().unwrap_or("N/A"),
            r.description.as_deref().unwrap_or(""),
            r.answer,
        ));
    }
    format!("CONTESTO KB:\n{}", lines.join("\n"))
}

/// 升级应答模板：知道姓氏就个性化称呼，否则通用问候
pub fn handoff_message(last_name: Option<&str>, operator_name: &str) -> String {
    match last_name {
        Some(name) => format!(
            "Grazie, Sig./Sig.ra/Mx. {name}. Per offrirLe una risposta precisa la metto subito \
             in contatto con {operator_name}, che La ricontatterà al più presto."
        ),
        None => format!(
            "Grazie per il messaggio. Per offrirLe una risposta precisa la metto subito \
             in contatto con {operator_name}, che La ricontatterà al più presto."
        ),
    }
}

/// 哨兵检测：对模型输出做大小写不敏感的子串查找。
/// 子串匹配意味着模型偶然引用该 token 也会触发升级（沿用既有行为）。
pub fn contains_sentinel(output: &str) -> bool {
    output.to_uppercase().contains(HANDOFF_SENTINEL)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_detection_is_substring_and_case_insensitive() {
        assert!(contains_sentinel("[[HANDOFF_OPERATOR]]"));
        assert!(contains_sentinel("mi dispiace... handoff_operator"));
        assert!(contains_sentinel("testo prima [[Handoff_Operator]] testo dopo"));
        assert!(!contains_sentinel("La piscina apre alle 8."));
    }

    #[test]
    fn handoff_message_personalizes_when_last_name_known() {
        let named = handoff_message(Some("Rossi"), "Niccolò");
        assert!(named.contains("Sig./Sig.ra/Mx. Rossi"));
        assert!(named.contains("Niccolò"));

        let generic = handoff_message(None, "Niccolò");
        assert!(generic.starts_with("Grazie per il messaggio."));
        assert!(!generic.contains("Sig./Sig.ra/Mx."));
    }

    #[test]
    fn guardrails_embed_the_sentinel_marker() {
        assert!(guardrails().contains(HANDOFF_SENTINEL_MARKER));
    }
}
