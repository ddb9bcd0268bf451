use stockscan_contracts::attributes::{parse_analysis, AnalysisOutcome, AttributeRecord};
use stockscan_contracts::matching::{parse_remote_verdict, RemoteVerdict, NOT_FOUND};
use tracing::warn;

use crate::generation::{GenerationRequest, GenerationResult, ResilientGenerationCaller};
use crate::imaging::ImagePayload;

pub const ATTRIBUTE_PROMPT: &str = r#"Analiza la imagen de este objeto y proporciona sus atributos. Responde únicamente con un objeto JSON válido, sin texto adicional.
El objeto JSON debe tener exactamente las siguientes claves:
- "main_object": (string) El nombre genérico del objeto principal (ej: "taza", "teclado", "destornillador").
- "main_color": (string) El color dominante del objeto.
- "secondary_colors": (array of strings) Una lista de otros colores significativos presentes.
- "shape": (string) Una breve descripción de la forma principal (ej: "cilíndrica", "rectangular").
- "material": (string) Tu mejor suposición sobre el material principal (ej: "plástico", "metal", "cerámica").
- "features": (array of strings) Una lista de características visuales notables (ej: "tiene un asa", "con logo", "teclas negras").

Ejemplo de respuesta para una taza de café blanca:
{
  "main_object": "taza",
  "main_color": "blanco",
  "secondary_colors": ["negro"],
  "shape": "cilíndrica",
  "material": "cerámica",
  "features": ["tiene un asa", "interior oscuro"]
}

Ahora analiza la imagen que te proporciono y devuelve solo el JSON."#;

/// Ranking prompt asking the model to pick one of `names` for the pictured object.
pub fn identification_prompt(names: &[String], attributes: Option<&AttributeRecord>) -> String {
    let mut prompt = String::from(
        "Eres un asistente de inventario. Identifica el objeto de la imagen eligiendo \
         exactamente uno de los nombres de esta lista de inventario:\n",
    );
    for name in names {
        prompt.push_str("- ");
        prompt.push_str(name);
        prompt.push('\n');
    }
    if let Some(record) = attributes.filter(|record| !record.is_empty()) {
        prompt.push_str("\nAtributos ya extraídos de la imagen:\n");
        prompt.push_str(&record.to_json());
        prompt.push('\n');
    }
    prompt.push_str(&format!(
        "\nResponde únicamente con un objeto JSON con las claves \"best_match\" (un nombre \
         copiado literalmente de la lista, o \"{NOT_FOUND}\" si ninguno corresponde) y \
         \"reasoning\" (una frase breve)."
    ));
    prompt
}

/// Vision calls that turn an image into attribute text or a ranking verdict.
#[derive(Clone)]
pub struct AttributeExtractionAdapter {
    caller: ResilientGenerationCaller,
}

impl AttributeExtractionAdapter {
    pub fn new(caller: ResilientGenerationCaller) -> Self {
        Self { caller }
    }

    pub fn extract_result(&self, image: &ImagePayload) -> GenerationResult {
        self.caller
            .call(&GenerationRequest::with_image(ATTRIBUTE_PROMPT, image))
    }

    /// Raw model text, expected but not guaranteed to be the attribute JSON.
    ///
    /// Exhausted fallbacks come back as `{"error": ...}` text rather than an error.
    pub fn extract(&self, image: &ImagePayload) -> String {
        self.extract_result(image).into_text()
    }

    /// The parsed answer together with the attempt trail that produced it.
    pub fn extract_outcome(&self, image: &ImagePayload) -> (AnalysisOutcome, GenerationResult) {
        let result = self.extract_result(image);
        let outcome = parse_analysis(&result.clone().into_text());
        (outcome, result)
    }

    /// Asks the model to choose among `names`. The verdict is `None` when the call fails
    /// or the answer names nothing on the list.
    pub fn identify_remote(
        &self,
        image: &ImagePayload,
        names: &[String],
        attributes: Option<&AttributeRecord>,
    ) -> (Option<RemoteVerdict>, GenerationResult) {
        let prompt = identification_prompt(names, attributes);
        let result = self
            .caller
            .call(&GenerationRequest::with_image(&prompt, image));
        let Some(text) = result.text() else {
            warn!(
                error = %result.error_message().unwrap_or_default(),
                "remote identification unavailable"
            );
            return (None, result);
        };
        let verdict = parse_remote_verdict(text, names);
        if verdict.is_none() {
            warn!("remote identification answer named no inventory item");
        }
        (verdict, result)
    }
}
