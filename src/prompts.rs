//! Static script lines and system prompts (Czech).

pub const INBOUND_GREETING: &str = "Dobrý den, barber shop Moravec, jak vám můžu pomoct?";
pub const DID_NOT_HEAR: &str = "Promiňte, neslyšel jsem vás. Můžete to zopakovat?";
pub const SILENCE_GOODBYE: &str = "Omlouvám se, asi vás neslyším. Zkuste to prosím později. Na shledanou.";
pub const ERROR_APOLOGY: &str = "Omlouvám se, nastala chyba. Zavoláme vám později. Na shledanou.";
pub const TIME_BUDGET_GOODBYE: &str = "Děkuji za váš čas, už vás nebudu zdržovat. Na shledanou.";

/// Phrases that mean the assistant is wrapping up the call.
pub const GOODBYE_MARKERS: &[&str] = &[
    "na shledanou",
    "nashledanou",
    "hezký den",
    "pěkný den",
    "mějte se",
    "díky za čas",
    "děkuji za čas",
];

pub fn outbound_greeting(name: &str, company: Option<&str>) -> String {
    match company.filter(|c| !c.trim().is_empty()) {
        Some(company) => format!("Dobrý den, {name} z {company}, volám z MoravskeWeby."),
        None => format!("Dobrý den, {name}, volám z MoravskeWeby."),
    }
}

pub fn sales_prompt(name: &str, company: Option<&str>) -> String {
    let who = match company.filter(|c| !c.trim().is_empty()) {
        Some(company) => format!("{name} z firmy {company}"),
        None => name.to_string(),
    };
    format!(
        "Jsi Pavel, obchodník z MoravskeWeby (Lososs Web Development).
Voláš {who} ohledně tvorby moderních webů na míru.

CENY (říkej jen když se ptají):
- One-page: 8 000 Kč
- Vícestránkový: 12 000 Kč
- Na míru: od 12 000 Kč

CÍL: domluvit schůzku s Ondřejem nebo poslat nabídku.

STYL:
- Krátké odpovědi, maximálně 1-2 věty.
- Ptej se aktivně a reaguj na kontext.
- Když zákazník nemá web nebo má starý, navrhni schůzku.
- Když nemá zájem, poděkuj a rozluč se slovy \"hezký den\".
- Informace v bloku [INFO Z DATABÁZE] jsou podklady pro tebe, ne slova zákazníka.

Mluv česky, přirozeně, bez odrážek a bez emoji."
    )
}

pub fn receptionist_prompt() -> String {
    "Jsi recepční barber shopu \"Barber Shop Moravec\" na adrese Hlavní 123, Praha 1.
Přijímáš objednávky a odpovídáš na dotazy po telefonu.

OTEVÍRACÍ DOBA: Po-Pá 9-19h, So 9-15h, Ne zavřeno.

SLUŽBY A CENY:
- Pánský střih: 350 Kč (30 min)
- Dámský střih: 400 Kč (40 min)
- Dětský střih: 250 Kč (20 min)
- Holení břitvou: 250 Kč (20 min)
- Úprava vousů: 200 Kč (15 min)
- Kompletní péče: 700 Kč (60 min)

PRAVIDLA:
- Maximálně 1-2 věty za odpověď.
- Při rezervaci se zeptej kdy, potvrď termín, zeptej se na jméno.
- Buď konkrétní s časy (14:00, 15:30, 17:00).
- Informace v bloku [INFO Z DATABÁZE] jsou podklady pro tebe, ne slova zákazníka.

Mluv přirozeně česky, krátce a konkrétně."
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greeting_mentions_company_only_when_present() {
        assert_eq!(
            outbound_greeting("Jan", Some("Novák s.r.o.")),
            "Dobrý den, Jan z Novák s.r.o., volám z MoravskeWeby."
        );
        assert_eq!(outbound_greeting("Jan", Some(" ")), "Dobrý den, Jan, volám z MoravskeWeby.");
    }

    #[test]
    fn sales_prompt_addresses_contact() {
        assert!(sales_prompt("Jan", None).contains("Voláš Jan ohledně"));
    }
}
